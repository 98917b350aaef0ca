//! 에러 타입 정의

use std::time::Duration;

use thiserror::Error;

use crate::frame::ProtocolVersion;

/// tcp_io 클라이언트 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("설정 에러: {0}")]
    Config(String),

    #[error("연결 실패: {0}")]
    Connect(String),

    #[error("잘못된 tcp_io_block 버전: {server} (최소 요구 버전 {minimum})")]
    Version {
        server: ProtocolVersion,
        minimum: ProtocolVersion,
    },

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("버퍼 부족: 필요 {needed} bytes, 제공 {got} bytes")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("타임아웃: {operation} ({timeout:?})")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("세션 중단됨: {reason}")]
    SessionAborted { reason: String },

    #[error("연결되지 않음")]
    NotConnected,

    #[error("전송 중단: 선언 {declared} bytes 중 {received} bytes 수신 후 종료 태그 수신")]
    TruncatedTransfer { declared: u64, received: u64 },
}

/// 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connect,
    Version,
    Protocol,
    Io,
}

impl Error {
    /// 에러 분류 반환
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Connect(_) => ErrorKind::Connect,
            Error::Version { .. } => ErrorKind::Version,
            Error::Protocol(_)
            | Error::BufferTooSmall { .. }
            | Error::Serialization(_)
            | Error::TruncatedTransfer { .. } => ErrorKind::Protocol,
            Error::Io(_)
            | Error::Timeout { .. }
            | Error::SessionAborted { .. }
            | Error::NotConnected => ErrorKind::Io,
        }
    }

    /// 세션 중단(이전 에러로 인한 short-circuit) 여부
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::SessionAborted { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
