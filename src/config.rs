//! 세션 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, SOCKET_CONFIG_SIZE, WAIT_STEP_SECS, WORD_SIZE};

/// 청크 전송 시 데이터 뒤에 붙는 패딩 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkFramingMode {
    /// 데이터 뒤 8바이트 경계까지만 패딩
    Chunks,
    /// 블록 경계까지 패딩한 뒤 8바이트 경계 패딩 (수신측 drain 규칙과 동일)
    Blocks,
}

/// tcp_io 세션 설정
///
/// 세션 시작 후에는 변경하지 않는다. 서버가 협상한 값은
/// [`NegotiatedParameters`](crate::NegotiatedParameters)에 따로 보관된다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 서버 주소 (호스트명 또는 IP)
    pub host: String,

    /// 서버 포트
    pub port: u16,

    /// 요청 블록 크기 (바이트, 8의 배수)
    pub block_size: usize,

    /// 요청 소켓 수
    pub sockets: usize,

    /// duplex 모드 (한 소켓으로 송수신)
    pub duplex: bool,

    /// 블록 송신 후 대기 시간
    pub delay_send: Duration,

    /// 블록 수신 후 대기 시간
    pub delay_receive: Duration,

    /// 송수신 타임아웃 (0이면 무제한)
    pub io_timeout: Duration,

    /// 연결/핸드쉐이크 대기 예산
    pub wait_connect: Duration,

    /// 재시도 간격
    pub wait_step: Duration,

    /// 소켓 연결 사이 대기 시간
    pub delay_after_connect: Duration,

    /// 송수신 블록 hex 덤프 출력
    pub display_raw: bool,

    /// terminate 전송 시 exit 태그도 함께 전송
    pub exit_on_terminate: bool,

    /// 모든 소켓의 socket-config 값을 소켓 0과 비교 검증
    pub strict_handshake: bool,

    /// 청크 전송 패딩 방식
    pub chunk_framing: ChunkFramingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            block_size: DEFAULT_BLOCK_SIZE,
            sockets: 1,
            duplex: false,
            delay_send: Duration::ZERO,
            delay_receive: Duration::ZERO,
            io_timeout: Duration::ZERO,
            wait_connect: Duration::ZERO,
            wait_step: Duration::from_secs(WAIT_STEP_SECS),
            delay_after_connect: Duration::ZERO,
            display_raw: false,
            exit_on_terminate: false,
            strict_handshake: false,
            chunk_framing: ChunkFramingMode::Chunks,
        }
    }
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_sockets(mut self, sockets: usize, duplex: bool) -> Self {
        self.sockets = sockets;
        self.duplex = duplex;
        self
    }

    pub fn with_delays(mut self, delay_send: Duration, delay_receive: Duration) -> Self {
        self.delay_send = delay_send;
        self.delay_receive = delay_receive;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_wait_connect(mut self, budget: Duration, step: Duration) -> Self {
        self.wait_connect = budget;
        self.wait_step = step;
        self
    }

    pub fn with_delay_after_connect(mut self, delay: Duration) -> Self {
        self.delay_after_connect = delay;
        self
    }

    pub fn with_display_raw(mut self, display_raw: bool) -> Self {
        self.display_raw = display_raw;
        self
    }

    pub fn with_exit_on_terminate(mut self, exit: bool) -> Self {
        self.exit_on_terminate = exit;
        self
    }

    pub fn with_strict_handshake(mut self, strict: bool) -> Self {
        self.strict_handshake = strict;
        self
    }

    pub fn with_chunk_framing(mut self, mode: ChunkFramingMode) -> Self {
        self.chunk_framing = mode;
        self
    }

    /// 연결 전 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("호스트가 지정되지 않음".into()));
        }
        validate_block_size(self.block_size)?;
        if self.sockets == 0 {
            return Err(Error::Config("소켓 수는 1 이상이어야 함".into()));
        }
        if !self.duplex && self.sockets > 1 && self.sockets % 2 != 0 {
            return Err(Error::Config(format!(
                "duplex가 아닐 때 소켓 수는 짝수여야 함: {}",
                self.sockets
            )));
        }
        if self.wait_step.is_zero() && !self.wait_connect.is_zero() {
            return Err(Error::Config("wait_step은 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 같은 서버를 가리키는지 (주소 + 포트)
    pub fn is_same_endpoint(&self, other: &SessionConfig) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// 소켓 수 1이면 항상 duplex
    pub fn effective_duplex(&self) -> bool {
        self.duplex || self.sockets == 1
    }

    /// "host:port" 문자열
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 블록 크기 검증: socket-config 블록을 담을 수 있는 8의 배수
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % WORD_SIZE != 0 {
        return Err(Error::Config(format!(
            "블록 크기는 {}의 양의 배수여야 함: {}",
            WORD_SIZE, block_size
        )));
    }
    if block_size < SOCKET_CONFIG_SIZE {
        return Err(Error::Config(format!(
            "블록 크기는 최소 {} bytes: {}",
            SOCKET_CONFIG_SIZE, block_size
        )));
    }
    Ok(())
}

/// 변환기용 블록 크기 정규화
///
/// [128, 65536] 범위로 자른 뒤 128의 배수로 올림
pub fn normalize_block_size(block_size: usize) -> usize {
    const MULTIPLIER: usize = 128;
    const MAX_BLOCK_SIZE: usize = 65536;

    let size = block_size.clamp(MULTIPLIER, MAX_BLOCK_SIZE);
    let rem = size % MULTIPLIER;
    if rem == 0 {
        return size;
    }

    let adjusted = size + MULTIPLIER - rem;
    warn!("Wrong buffer size. Set to {}", adjusted);
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid_with_host() {
        let config = SessionConfig::new("127.0.0.1", 12340);
        assert!(config.validate().is_ok());
        assert!(config.effective_duplex());
    }

    #[test]
    fn test_block_size_must_be_word_multiple() {
        for bad in [0usize, 12, 100, 4097, 56] {
            let config = SessionConfig::new("localhost", 1).with_block_size(bad);
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "block size {}", bad);
        }
        assert!(SessionConfig::new("localhost", 1)
            .with_block_size(128)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_odd_sockets_without_duplex_rejected() {
        let config = SessionConfig::new("localhost", 1).with_sockets(3, false);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = SessionConfig::new("localhost", 1).with_sockets(3, true);
        assert!(config.validate().is_ok());

        let config = SessionConfig::new("localhost", 1).with_sockets(4, false);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_same_endpoint() {
        let a = SessionConfig::new("host", 1000).with_block_size(128);
        let b = SessionConfig::new("host", 1000).with_block_size(4096);
        let c = SessionConfig::new("host", 1001);
        assert!(a.is_same_endpoint(&b));
        assert!(!a.is_same_endpoint(&c));
    }

    #[test]
    fn test_normalize_block_size() {
        assert_eq!(normalize_block_size(1), 128);
        assert_eq!(normalize_block_size(128), 128);
        assert_eq!(normalize_block_size(129), 256);
        assert_eq!(normalize_block_size(4096), 4096);
        assert_eq!(normalize_block_size(1_000_000), 65536);
    }
}
