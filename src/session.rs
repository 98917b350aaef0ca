//! 세션
//!
//! 연결 → 전송 → 종료 → 해제 수명 주기를 관리한다.

use std::sync::Arc;

use tracing::{error, info};

use crate::chunk::{framing_for, ChunkChannel, ChunkFraming};
use crate::connector::connect_pool;
use crate::frame::ProtocolVersion;
use crate::handshake::NegotiatedParameters;
use crate::pool::SocketPool;
use crate::stats::SessionStats;
use crate::transport::BlockTransport;
use crate::{Error, Result, SessionConfig, CLIENT_VERSION};

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Undefined,
    Initialized,
    Connected,
    Disconnected,
}

/// tcp_io 클라이언트 세션
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: ConnectionState,
    pool: Option<Arc<SocketPool>>,
    negotiated: Option<NegotiatedParameters>,
    stats: Arc<SessionStats>,
    /// 연결 실패 등 풀 밖에서 발생한 마지막 에러
    last_error: Option<String>,
}

impl Session {
    /// 설정 검증 후 세션 생성
    pub fn new(config: SessionConfig) -> Result<Self> {
        info!(
            "TCP client library version: {}",
            ProtocolVersion(CLIENT_VERSION)
        );
        config.validate()?;
        info!("Initialization of connection to {}", config.host);

        Ok(Self {
            config,
            state: ConnectionState::Initialized,
            pool: None,
            negotiated: None,
            stats: Arc::new(SessionStats::new()),
            last_error: None,
        })
    }

    /// 설정 교체
    ///
    /// 주소와 포트가 같으면 아무것도 하지 않고 false
    pub fn reinit(&mut self, config: SessionConfig) -> Result<bool> {
        config.validate()?;
        if self.config.is_same_endpoint(&config) {
            return Ok(false);
        }

        self.disconnect();
        info!("Initialization of connection to {}", config.host);
        self.config = config;
        self.state = ConnectionState::Initialized;
        Ok(true)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 현재 상태
    ///
    /// 풀이 에러로 닫혔으면 Disconnected
    pub fn state(&self) -> ConnectionState {
        match (&self.pool, self.state) {
            (Some(pool), ConnectionState::Connected) if pool.is_closed() => {
                ConnectionState::Disconnected
            }
            (_, state) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 협상된 파라미터 (연결 후)
    pub fn negotiated(&self) -> Option<NegotiatedParameters> {
        self.negotiated
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// 마지막 에러 메시지
    pub fn last_error(&self) -> Option<String> {
        self.pool
            .as_ref()
            .and_then(|pool| pool.fault())
            .or_else(|| self.last_error.clone())
    }

    /// 모든 소켓 연결
    ///
    /// 이미 연결되어 있으면 먼저 해제한다. 이전 에러는 초기화된다
    pub async fn connect(&mut self) -> Result<()> {
        if self.pool.is_some() {
            self.disconnect();
        }
        self.last_error = None;

        match connect_pool(&self.config).await {
            Ok((pool, negotiated)) => {
                self.stats.reset();
                self.pool = Some(Arc::new(pool));
                self.negotiated = Some(negotiated);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                error!("ERROR: {}", e);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// 모든 소켓 닫기
    pub fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close_all();
            info!("Disconnected from {}", self.config.endpoint());
        }
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn pool(&self) -> Result<&Arc<SocketPool>> {
        match &self.pool {
            Some(pool) if self.state == ConnectionState::Connected => Ok(pool),
            _ => Err(Error::NotConnected),
        }
    }

    /// 블록 전송 핸들 (복제해서 태스크에 전달)
    pub fn transport(&self) -> Result<BlockTransport> {
        let pool = self.pool()?;
        let block_size = self
            .negotiated
            .map(|n| n.block_size)
            .ok_or(Error::NotConnected)?;
        Ok(BlockTransport::new(
            pool.clone(),
            self.stats.clone(),
            block_size,
            &self.config,
        ))
    }

    /// 청크 전송용 원시 채널
    pub fn chunk_channel(&self) -> Result<ChunkChannel> {
        let pool = self.pool()?;
        Ok(ChunkChannel::new(pool.clone(), self.stats.clone()))
    }

    /// 설정된 청크 프레이밍 (협상된 블록 크기 기준)
    pub fn chunk_framing(&self) -> Result<Box<dyn ChunkFraming>> {
        let negotiated = self.negotiated.ok_or(Error::NotConnected)?;
        Ok(framing_for(self.config.chunk_framing, negotiated.block_size))
    }

    /// 재연결 후 exit + terminate 전송, 응답 블록 1개 수신
    ///
    /// 반환값은 수신 바이트 수
    pub async fn send_exit(&mut self) -> Result<usize> {
        self.disconnect();
        self.connect().await?;

        let transport = self.transport()?;
        let expected = transport.block_size() * transport.pool().send_sockets();
        let sent = transport.send_terminate_exit().await?;
        if sent != expected {
            return Err(Error::Protocol(format!(
                "Error of sending the terminate flag and exit flag: {} / {} bytes",
                sent, expected
            )));
        }
        info!("The send of terminate flag and exit flag is executed successfully");

        let mut block = vec![0u8; transport.block_size()];
        transport.receive(&mut block).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
