//! 소켓별 핸드쉐이크
//!
//! 연결 직후 서버가 보내는 socket-config 블록을 읽어 협상 파라미터를 얻는다.
//! 소켓 0의 값이 세션 전체에 적용되고, 나머지 소켓은 자신의 식별자만 제공한다.

use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connector::RetryBudget;
use crate::frame::{hex_dump, ProtocolVersion, SocketConfigFrame};
use crate::{Error, Result, SessionConfig, MIN_SERVER_VERSION, SOCKET_CONFIG_SIZE, WORD_SIZE};

/// 서버가 협상한 세션 파라미터 (소켓 0 기준, 세션 동안 고정)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParameters {
    /// 서버 tcp_io_block 버전
    pub version: ProtocolVersion,

    /// 블록 크기 (바이트)
    pub block_size: usize,

    /// 소켓 수
    pub sockets: usize,

    /// duplex 모드
    pub duplex: bool,
}

impl NegotiatedParameters {
    /// 소켓 0의 socket-config 블록에서 파라미터 도출
    ///
    /// 버전 검사는 재시도 없이 세션 전체를 실패시킨다
    pub fn from_frame(frame: &SocketConfigFrame) -> Result<Self> {
        let minimum = ProtocolVersion(MIN_SERVER_VERSION);
        let version = frame.version();
        if !version.is_supported(minimum) {
            return Err(Error::Version {
                server: version,
                minimum,
            });
        }

        let block_size = frame.block_size as usize;
        if block_size < SOCKET_CONFIG_SIZE || block_size % WORD_SIZE != 0 {
            return Err(Error::Protocol(format!(
                "서버가 잘못된 블록 크기를 협상함: {}",
                block_size
            )));
        }

        let sockets = frame.sockets as usize;
        let duplex = frame.is_duplex();
        if sockets == 0 {
            return Err(Error::Protocol("서버가 소켓 수 0을 협상함".into()));
        }
        if !duplex && sockets > 1 && sockets % 2 != 0 {
            return Err(Error::Protocol(format!(
                "서버가 simplex 모드에서 홀수 소켓 수를 협상함: {}",
                sockets
            )));
        }

        Ok(Self {
            version,
            block_size,
            sockets,
            duplex: duplex || sockets == 1,
        })
    }

    /// 송신 소켓 수 (= 수신 소켓 수)
    pub fn lane_count(&self) -> usize {
        if self.duplex {
            self.sockets
        } else {
            self.sockets / 2
        }
    }

    /// 다른 소켓이 보낸 값이 같은지 검사
    ///
    /// strict 모드가 아니면 경고만 남긴다
    pub fn cross_check(&self, frame: &SocketConfigFrame, strict: bool) -> Result<()> {
        let mut mismatches = Vec::new();
        if frame.version() != self.version {
            mismatches.push(format!("version {} != {}", frame.version(), self.version));
        }
        if frame.block_size as usize != self.block_size {
            mismatches.push(format!("block size {} != {}", frame.block_size, self.block_size));
        }
        if frame.sockets as usize != self.sockets {
            mismatches.push(format!("sockets {} != {}", frame.sockets, self.sockets));
        }
        // 소켓 1개 세션은 항상 duplex로 취급
        if self.sockets > 1 && frame.is_duplex() != self.duplex {
            mismatches.push(format!("duplex {} != {}", frame.is_duplex(), self.duplex));
        }

        if mismatches.is_empty() {
            return Ok(());
        }

        let detail = mismatches.join(", ");
        if strict {
            return Err(Error::Protocol(format!(
                "소켓 {}의 socket-config 값이 소켓 0과 다름: {}",
                frame.socket_id, detail
            )));
        }
        warn!(
            "Socket {} advertises different parameters ({}), socket 0 values kept",
            frame.socket_id, detail
        );
        Ok(())
    }

    fn log_table(&self, config: &SessionConfig, send_buffer: usize, recv_buffer: usize) {
        let title = "*********** TCP client parameters: ***********";
        info!("{}", title);
        info!("tcp_io_block version:                  {}", self.version);
        info!("Host:                                  {}", config.host);
        info!("Port:                                  {}", config.port);
        info!("Count of sockets:                      {}", self.sockets);
        info!(
            "Use duplex mode of socket:             {}",
            if self.duplex { "yes" } else { "no" }
        );
        info!("TCP block size in bytes:               {}", self.block_size);
        info!("Delay after every receiving of data:   {:?}", config.delay_receive);
        info!("Delay after every sending of data:     {:?}", config.delay_send);
        info!("Timeout:                               {:?}", config.io_timeout);
        info!(
            "Print info to console:                 {}",
            if config.display_raw { "yes" } else { "no" }
        );
        info!("System socket send buffer size:        {}", send_buffer);
        info!("System socket receive buffer size:     {}", recv_buffer);
        info!("{}", "*".repeat(title.len()));
    }
}

/// 한 소켓의 핸드쉐이크 결과
#[derive(Debug, Clone, Copy)]
pub struct SocketHandshake {
    /// 서버가 배정한 소켓 식별자
    pub socket_id: usize,

    /// 세션 파라미터 (소켓 0 기준)
    pub parameters: NegotiatedParameters,
}

/// 소켓 하나의 핸드쉐이크 수행
///
/// `index`는 연결 순서. `authoritative`가 None이면 이 소켓이 소켓 0이다.
pub async fn negotiate_socket(
    stream: &mut TcpStream,
    index: usize,
    config: &SessionConfig,
    authoritative: Option<NegotiatedParameters>,
) -> Result<SocketHandshake> {
    let mut head = [0u8; SOCKET_CONFIG_SIZE];
    read_config_block(stream, &mut head, config).await?;
    if config.display_raw {
        info!("{}", hex_dump(&head, &format!("Socket-config block #{}", index)));
    }

    let frame = SocketConfigFrame::decode(&head)?;
    let parameters = match authoritative {
        None => NegotiatedParameters::from_frame(&frame)?,
        Some(parameters) => {
            parameters.cross_check(&frame, config.strict_handshake)?;
            parameters
        }
    };

    let (send_buffer, recv_buffer) = grow_socket_buffers(stream, parameters.block_size)?;
    if authoritative.is_none() {
        parameters.log_table(config, send_buffer, recv_buffer);
    }

    // 블록의 나머지 부분 비우기
    let mut rest = vec![0u8; parameters.block_size - SOCKET_CONFIG_SIZE];
    let drain = stream.read_exact(&mut rest);
    let drained = match step_timeout(config.wait_step) {
        Some(step) => tokio::time::timeout(step, drain)
            .await
            .map_err(|_| Error::Connect("핸드쉐이크 블록 나머지 수신 타임아웃".into()))?,
        None => drain.await,
    };
    drained.map_err(|e| Error::Connect(format!("핸드쉐이크 블록 수신 실패: {}", e)))?;

    let socket_id = frame.socket_id as usize;
    info!(
        "Socket number: {} | Socket ID: {} | send buffer: {} | receive buffer: {}",
        index + 1,
        socket_id,
        send_buffer,
        recv_buffer
    );

    Ok(SocketHandshake {
        socket_id,
        parameters,
    })
}

/// socket-config 블록 선두 64바이트 수신
///
/// 대기 단위마다 타임아웃을 걸고 연결 대기 예산 안에서 재시도한다
async fn read_config_block(
    stream: &mut TcpStream,
    head: &mut [u8; SOCKET_CONFIG_SIZE],
    config: &SessionConfig,
) -> Result<()> {
    let mut budget = RetryBudget::new(config.wait_connect, config.wait_step);
    let step = step_timeout(config.wait_step);
    let mut filled = 0;

    while filled < head.len() {
        let read = stream.read(&mut head[filled..]);
        let outcome = match step {
            Some(step) => tokio::time::timeout(step, read).await.ok(),
            None => Some(read.await),
        };

        match outcome {
            Some(Ok(0)) => {
                return Err(Error::Connect(format!(
                    "socket-config 수신 중 연결 종료 ({} / {} bytes)",
                    filled,
                    head.len()
                )));
            }
            Some(Ok(n)) => filled += n,
            Some(Err(e)) => {
                return Err(Error::Connect(format!("socket-config 수신 실패: {}", e)));
            }
            None => match budget.consume() {
                Some(_) => info!("Waiting of control block...{}s", budget.remaining().as_secs()),
                None => {
                    return Err(Error::Connect(format!(
                        "socket-config 대기 시간 초과 ({} / {} bytes)",
                        filled,
                        head.len()
                    )));
                }
            },
        }
    }
    Ok(())
}

/// 소켓 버퍼가 블록 크기보다 작으면 확장
fn grow_socket_buffers(stream: &TcpStream, block_size: usize) -> Result<(usize, usize)> {
    let sock = SockRef::from(stream);

    let mut send_buffer = sock.send_buffer_size()?;
    if block_size > send_buffer {
        sock.set_send_buffer_size(block_size)?;
        send_buffer = sock.send_buffer_size()?;
        debug!("SO_SNDBUF grown to {}", send_buffer);
    }

    let mut recv_buffer = sock.recv_buffer_size()?;
    if block_size > recv_buffer {
        sock.set_recv_buffer_size(block_size)?;
        recv_buffer = sock.recv_buffer_size()?;
        debug!("SO_RCVBUF grown to {}", recv_buffer);
    }

    Ok((send_buffer, recv_buffer))
}

/// 단위 대기 시간 (0이면 None)
pub(crate) fn step_timeout(step: Duration) -> Option<Duration> {
    if step.is_zero() {
        None
    } else {
        Some(step)
    }
}
