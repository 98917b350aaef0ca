//! 연결 관리
//!
//! 소켓마다 연결 재시도 → 핸드쉐이크 → 풀 배치 순서로 진행한다.
//! 연결할 소켓 수는 소켓 0의 핸드쉐이크에서 결정된다.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::handshake::{negotiate_socket, NegotiatedParameters};
use crate::pool::{PoolBuilder, SocketPool};
use crate::{Error, Result, SessionConfig};

/// 연결 대기 예산
///
/// 실패할 때마다 한 단계씩 차감하고, 남은 예산이 한 단계보다 작으면 포기
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    remaining: Duration,
    step: Duration,
}

impl RetryBudget {
    pub fn new(budget: Duration, step: Duration) -> Self {
        Self {
            remaining: budget,
            step,
        }
    }

    /// 실패 1회 기록
    ///
    /// 재시도할 수 있으면 대기할 시간을 반환
    pub fn consume(&mut self) -> Option<Duration> {
        if self.step.is_zero() || self.remaining < self.step {
            return None;
        }
        self.remaining -= self.step;
        Some(self.step)
    }

    /// 남은 예산
    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

/// TCP 연결 (재시도 포함)
pub async fn connect_stream(config: &SessionConfig) -> Result<TcpStream> {
    let endpoint = config.endpoint();
    let mut budget = RetryBudget::new(config.wait_connect, config.wait_step);

    loop {
        match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => {
                info!("CONNECTED {}", endpoint);
                return Ok(stream);
            }
            Err(e) => match budget.consume() {
                Some(step) => {
                    debug!("connect {} failed: {}", endpoint, e);
                    tokio::time::sleep(step).await;
                    info!("Waiting of connect...{}s", budget.remaining().as_secs());
                }
                None => {
                    return Err(Error::Connect(format!("{} 연결 실패: {}", endpoint, e)));
                }
            },
        }
    }
}

/// 서버가 정한 소켓 구성이 요청과 다른지
fn differs_from_request(config: &SessionConfig, parameters: &NegotiatedParameters) -> bool {
    parameters.sockets != config.sockets
        || parameters.duplex != config.effective_duplex()
        || parameters.block_size != config.block_size
}

/// 모든 소켓 연결 및 핸드쉐이크 후 풀 생성
pub async fn connect_pool(config: &SessionConfig) -> Result<(SocketPool, NegotiatedParameters)> {
    config.validate()?;
    let started = Instant::now();

    let mut negotiated: Option<NegotiatedParameters> = None;
    let mut builder: Option<PoolBuilder> = None;
    let mut index = 0;

    loop {
        info!("Connecting of TCP socket {}...", index + 1);
        let mut stream = connect_stream(config).await?;
        let handshake = negotiate_socket(&mut stream, index, config, negotiated).await?;
        let parameters = handshake.parameters;
        if index == 0 && differs_from_request(config, &parameters) {
            warn!(
                "Server settings differ from request: sockets {} -> {}, duplex {} -> {}, block size {} -> {}",
                config.sockets,
                parameters.sockets,
                config.effective_duplex(),
                parameters.duplex,
                config.block_size,
                parameters.block_size
            );
        }

        let mut pool_builder = match builder.take() {
            Some(b) => b,
            None => PoolBuilder::new(parameters.sockets, parameters.duplex)?,
        };
        pool_builder.add_socket(handshake.socket_id, stream)?;
        builder = Some(pool_builder);
        negotiated = Some(parameters);

        index += 1;
        if index >= parameters.sockets {
            break;
        }

        if !config.delay_after_connect.is_zero() {
            info!("Sleep {:?}", config.delay_after_connect);
            tokio::time::sleep(config.delay_after_connect).await;
        }
    }

    let (Some(builder), Some(parameters)) = (builder, negotiated) else {
        return Err(Error::Protocol("소켓이 연결되지 않음".into()));
    };

    let io_timeout = (!config.io_timeout.is_zero()).then_some(config.io_timeout);
    let pool = builder.build(io_timeout)?;
    pool.reset_cursors();

    info!(
        "Connected {} socket(s) to {} in {:.2}s",
        pool.sockets(),
        config.endpoint(),
        started.elapsed().as_secs_f64()
    );
    Ok((pool, parameters))
}
