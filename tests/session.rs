//! 세션 통합 테스트
//!
//! 로컬 TcpListener로 tcp_io 서버를 흉내 내고 연결부터 종료까지 검증한다.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tcpio::chunk::{send_chunk_terminate, ReceiveChunks, SendChunks};
use tcpio::frame::{encode_data_block, is_terminal};
use tcpio::sink::MemorySink;
use tcpio::{
    BlockFrame, ChunkFramingMode, ChunkStatus, ConnectionState, Error, ErrorKind, Session,
    SessionConfig, SocketConfigFrame, CLIENT_VERSION,
};

const BLOCK_SIZE: usize = 128;

/// 서버 흉내: 연결마다 socket-config 블록 전송
struct MockServer {
    listener: TcpListener,
    port: u16,
}

impl MockServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    fn config(&self) -> SessionConfig {
        SessionConfig::new("127.0.0.1", self.port).with_block_size(BLOCK_SIZE)
    }

    /// 프레임 수만큼 연결을 받아 핸드쉐이크 블록을 보낸 뒤 스트림 반환
    async fn accept(&self, frames: &[SocketConfigFrame], block_size: usize) -> Vec<TcpStream> {
        let mut streams = Vec::with_capacity(frames.len());
        for frame in frames {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            stream
                .write_all(&frame.encode_block(block_size).unwrap())
                .await
                .unwrap();
            streams.push(stream);
        }
        streams
    }
}

fn frames(sockets: u64, duplex: bool) -> Vec<SocketConfigFrame> {
    (0..sockets)
        .map(|id| SocketConfigFrame::new(CLIENT_VERSION, id, BLOCK_SIZE as u64, sockets, duplex))
        .collect()
}

async fn read_block(stream: &mut TcpStream) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    stream.read_exact(&mut block).await.unwrap();
    block
}

/// 종료 블록까지 블록을 그대로 되돌려 보내고 데이터 블록 길이 목록 반환
fn spawn_echo(server: MockServer) -> JoinHandle<Vec<u64>> {
    tokio::spawn(async move {
        let mut streams = server.accept(&frames(1, false), BLOCK_SIZE).await;
        let stream = &mut streams[0];
        let mut lengths = Vec::new();
        loop {
            let block = read_block(stream).await;
            stream.write_all(&block).await.unwrap();
            if is_terminal(&block) {
                break;
            }
            let frame = BlockFrame::parse(&block).unwrap();
            lengths.push(frame.length());
        }
        lengths
    })
}

#[tokio::test]
async fn test_single_socket_payload_echo() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let echo = spawn_echo(server);

    session.connect().await.unwrap();
    assert!(session.is_connected());
    let negotiated = session.negotiated().unwrap();
    assert_eq!(negotiated.block_size, BLOCK_SIZE);
    assert!(negotiated.duplex);

    let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    let transport = session.transport().unwrap();
    assert_eq!(transport.send_payload(&data).await.unwrap(), 300);
    assert_eq!(transport.send_terminate().await.unwrap(), BLOCK_SIZE);

    let received = transport.receive_all(1024).await.unwrap();
    assert_eq!(received, data);
    assert_eq!(echo.await.unwrap(), vec![112, 112, 76]);

    let stats = session.stats().snapshot();
    assert_eq!(stats.bytes_sent, 4 * BLOCK_SIZE as u64);
    assert_eq!(stats.bytes_received, 4 * BLOCK_SIZE as u64);
}

#[tokio::test]
async fn test_receive_into_memory_sink() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let echo = spawn_echo(server);
    session.connect().await.unwrap();

    let transport = session.transport().unwrap();
    transport.send_payload(b"hello tcp_io").await.unwrap();
    transport.send_terminate().await.unwrap();

    let mut sink = MemorySink::new();
    let report = transport.receive_into(&mut sink).await.unwrap();
    assert!(report.terminated);
    assert_eq!(report.blocks, 1);
    assert_eq!(report.payload_bytes, 12);
    assert_eq!(sink.data(), b"hello tcp_io");
    echo.await.unwrap();
}

#[tokio::test]
async fn test_receive_all_capacity_exceeded() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let echo = spawn_echo(server);
    session.connect().await.unwrap();

    let transport = session.transport().unwrap();
    transport.send_payload(&[7u8; 200]).await.unwrap();
    transport.send_terminate().await.unwrap();

    let err = transport.receive_all(150).await.unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { needed: 200, got: 150 }));
    echo.await.unwrap();
}

#[tokio::test]
async fn test_old_server_version_rejected() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let handle = tokio::spawn(async move {
        let old = SocketConfigFrame::new(0x0100_0000, 0, BLOCK_SIZE as u64, 1, false);
        let streams = server.accept(&[old], BLOCK_SIZE).await;
        streams
    });

    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Version);
    assert!(!session.is_connected());
    assert!(session.last_error().unwrap().contains("1.0.0.0"));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_simplex_roles_and_round_robin() {
    let server = MockServer::bind().await;
    let config = server.config().with_sockets(4, false);
    let mut session = Session::new(config).unwrap();

    let handle = tokio::spawn(async move {
        let mut streams = server.accept(&frames(4, false), BLOCK_SIZE).await;

        // 송신 소켓 0, 1에 번갈아 도착
        let mut firsts = Vec::new();
        for turn in 0..4 {
            let block = read_block(&mut streams[turn % 2]).await;
            let frame = BlockFrame::parse(&block).unwrap();
            firsts.push(frame.payload().unwrap()[0]);
        }

        // 수신 소켓 (ID 2, 3)에서 각각 다른 응답
        streams[2]
            .write_all(&encode_data_block(b"from-2", BLOCK_SIZE).unwrap())
            .await
            .unwrap();
        streams[3]
            .write_all(&encode_data_block(b"from-3", BLOCK_SIZE).unwrap())
            .await
            .unwrap();

        // terminate는 송신 소켓마다 1개
        assert!(is_terminal(&read_block(&mut streams[0]).await));
        assert!(is_terminal(&read_block(&mut streams[1]).await));
        firsts
    });

    session.connect().await.unwrap();
    let negotiated = session.negotiated().unwrap();
    assert!(!negotiated.duplex);
    assert_eq!(negotiated.lane_count(), 2);

    let transport = session.transport().unwrap();
    assert_eq!(transport.pool().send_sockets(), 2);
    assert_eq!(transport.pool().receive_sockets(), 2);

    let payload_capacity = transport.payload_capacity();
    let mut data = Vec::new();
    for marker in 1..=4u8 {
        data.extend(std::iter::repeat(marker).take(payload_capacity));
    }
    transport.send_payload(&data).await.unwrap();

    let mut buf = vec![0u8; payload_capacity];
    let (n, terminal) = transport.receive_payload(&mut buf).await.unwrap();
    assert!(!terminal);
    assert_eq!(&buf[..n], b"from-2");
    let (n, _) = transport.receive_payload(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from-3");

    assert_eq!(transport.send_terminate().await.unwrap(), 2 * BLOCK_SIZE);
    assert_eq!(handle.await.unwrap(), vec![1, 2, 3, 4]);
}

fn mismatched_frames() -> Vec<SocketConfigFrame> {
    vec![
        SocketConfigFrame::new(CLIENT_VERSION, 0, BLOCK_SIZE as u64, 2, true),
        SocketConfigFrame::new(CLIENT_VERSION + 1, 1, BLOCK_SIZE as u64, 2, true),
    ]
}

#[tokio::test]
async fn test_permissive_handshake_keeps_socket_zero_values() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config().with_sockets(2, true)).unwrap();
    let handle = tokio::spawn(async move {
        let streams = server.accept(&mismatched_frames(), BLOCK_SIZE).await;
        streams
    });

    session.connect().await.unwrap();
    let negotiated = session.negotiated().unwrap();
    assert_eq!(negotiated.version.0, CLIENT_VERSION);
    assert_eq!(negotiated.sockets, 2);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_strict_handshake_rejects_mismatch() {
    let server = MockServer::bind().await;
    let config = server
        .config()
        .with_sockets(2, true)
        .with_strict_handshake(true);
    let mut session = Session::new(config).unwrap();
    let handle = tokio::spawn(async move {
        let streams = server.accept(&mismatched_frames(), BLOCK_SIZE).await;
        streams
    });

    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(session.state(), ConnectionState::Initialized);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_error_is_sticky_after_peer_close() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let handle = tokio::spawn(async move {
        let streams = server.accept(&frames(1, false), BLOCK_SIZE).await;
        drop(streams);
    });

    session.connect().await.unwrap();
    handle.await.unwrap();

    let transport = session.transport().unwrap();
    let mut block = vec![0u8; BLOCK_SIZE];
    let first = transport.receive(&mut block).await.unwrap_err();
    assert!(!first.is_aborted());

    let second = transport.send_payload(b"after close").await.unwrap_err();
    assert!(second.is_aborted());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.last_error().is_some());
}

#[tokio::test]
async fn test_io_timeout_aborts_session() {
    let server = MockServer::bind().await;
    let config = server.config().with_io_timeout(Duration::from_millis(50));
    let mut session = Session::new(config).unwrap();
    let handle = tokio::spawn(async move {
        let streams = server.accept(&frames(1, false), BLOCK_SIZE).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(streams);
    });

    session.connect().await.unwrap();
    let transport = session.transport().unwrap();
    let mut block = vec![0u8; BLOCK_SIZE];
    let err = transport.receive(&mut block).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(transport.receive(&mut block).await.unwrap_err().is_aborted());
    handle.await.unwrap();
}

#[tokio::test]
async fn test_connect_retries_until_budget_spent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = SessionConfig::new("127.0.0.1", port)
        .with_wait_connect(Duration::from_millis(30), Duration::from_millis(10));
    let mut session = Session::new(config).unwrap();

    let started = std::time::Instant::now();
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_silent_server_exhausts_handshake_budget() {
    let server = MockServer::bind().await;
    let config = server
        .config()
        .with_wait_connect(Duration::from_millis(20), Duration::from_millis(10));
    let mut session = Session::new(config).unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = server.listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(stream);
    });

    let started = std::time::Instant::now();
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(session.last_error().unwrap().contains("0 / 64"));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_split_socket_config_within_budget() {
    let server = MockServer::bind().await;
    let config = server
        .config()
        .with_wait_connect(Duration::from_millis(200), Duration::from_millis(10));
    let mut session = Session::new(config).unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = server.listener.accept().await.unwrap();
        let block = frames(1, false)[0].encode_block(BLOCK_SIZE).unwrap();
        stream.write_all(&block[..32]).await.unwrap();
        // 한 단계 이상 대기 후 나머지 전송
        tokio::time::sleep(Duration::from_millis(15)).await;
        stream.write_all(&block[32..]).await.unwrap();
        stream
    });

    session.connect().await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.negotiated().unwrap().block_size, BLOCK_SIZE);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_send_exit_reconnects_and_reads_reply() {
    let server = MockServer::bind().await;
    let mut session = Session::new(server.config()).unwrap();
    let handle = tokio::spawn(async move {
        // send_exit는 먼저 재연결한다
        let mut streams = server.accept(&frames(1, false), BLOCK_SIZE).await;
        let block = read_block(&mut streams[0]).await;
        let frame = BlockFrame::parse(&block).unwrap();
        streams[0].write_all(&block).await.unwrap();
        frame.control_tags()
    });

    let received = session.send_exit().await.unwrap();
    assert_eq!(received, BLOCK_SIZE);
    let tags = handle.await.unwrap();
    assert_eq!(tags.len(), 2);
}

#[tokio::test]
async fn test_chunk_channel_block_framing_echo() {
    let server = MockServer::bind().await;
    let config = server.config().with_chunk_framing(ChunkFramingMode::Blocks);
    let mut session = Session::new(config).unwrap();
    let handle = tokio::spawn(async move {
        let mut streams = server.accept(&frames(1, false), BLOCK_SIZE).await;
        let (mut reader, mut writer) = streams.remove(0).into_split();
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
    });

    session.connect().await.unwrap();
    let mut channel = session.chunk_channel().unwrap();
    let data: Vec<u8> = (0..200u8).collect();

    {
        let mut sender = SendChunks::with_framing(
            &mut channel,
            data.len() as u64,
            session.chunk_framing().unwrap(),
        );
        sender.send_data_block(&data[..90]).await.unwrap();
        sender.send_data_block(&data[90..]).await.unwrap();
        assert_eq!(sender.status(), ChunkStatus::AllData);
    }
    send_chunk_terminate(&mut channel).await.unwrap();

    let mut receiver = ReceiveChunks::new(&mut channel, BLOCK_SIZE).await.unwrap();
    assert_eq!(receiver.data_size(), 200);
    let mut out = vec![0u8; 200];
    let mut got = 0;
    while got < out.len() {
        let n = receiver
            .receive_data_block(&mut out[got..], 64)
            .await
            .unwrap();
        got += n;
    }
    assert_eq!(out, data);
    assert_eq!(receiver.status(), ChunkStatus::Finish);
    assert_eq!(receiver.completed_units(), &[200]);
    receiver.check_complete().unwrap();

    session.disconnect();
    handle.await.unwrap();
}
