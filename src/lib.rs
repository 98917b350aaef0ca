//! # tcpio
//!
//! tcp_io 프로토콜 클라이언트 (블록 프레이밍 기반 멀티 소켓 TCP 전송)
//!
//! ## 핵심 특징
//! - **고정 크기 블록**: 모든 데이터는 협상된 블록 크기 단위로 전송
//! - **핸드쉐이크**: 서버가 소켓마다 socket-config 블록으로 파라미터 통보
//! - **멀티 소켓**: duplex / 송신 전용 / 수신 전용 역할 분배, 라운드 로빈 스케줄링
//! - **청크 전송**: 블록 헤더 없이 임의 길이 데이터를 연속 스트림으로 전송
//! - **종료 핸드쉐이크**: terminate / exit 서비스 블록

pub mod app;
pub mod chunk;
pub mod config;
pub mod connector;
pub mod convert;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod pool;
pub mod session;
pub mod sink;
pub mod stats;
pub mod stdio;
pub mod transport;

pub use chunk::{ChunkStatus, ReceiveChunks, SendChunks};
pub use config::{ChunkFramingMode, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use frame::{BlockFrame, ControlTag, DataType, ProtocolVersion, SocketConfigFrame};
pub use handshake::NegotiatedParameters;
pub use pool::{Role, SocketPool};
pub use session::{ConnectionState, Session};
pub use stats::{SessionStats, TransferStats};
pub use transport::BlockTransport;

/// 클라이언트 라이브러리 버전 (1.0.0.1)
pub const CLIENT_VERSION: u64 = 0x0100_0001;

/// 허용하는 최소 서버(tcp_io_block) 버전 (1.0.0.1)
pub const MIN_SERVER_VERSION: u64 = 0x0100_0001;

/// 프로토콜 워드 크기 (바이트)
pub const WORD_SIZE: usize = 8;

/// 블록 헤더 크기 (word0 = 길이, word1 = 타입)
pub const BLOCK_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// socket-config 블록 크기 (8 워드)
pub const SOCKET_CONFIG_SIZE: usize = 8 * WORD_SIZE;

/// 기본 블록 크기 (바이트)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// 기본 포트
pub const DEFAULT_PORT: u16 = 12340;

/// 연결/핸드쉐이크 재시도 간격 (초)
pub const WAIT_STEP_SECS: u64 = 5;
