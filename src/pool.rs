//! 소켓 풀
//!
//! 세션의 TCP 연결을 소유하고 역할(송신/수신/양방향)에 따라 분배한다.
//! 송신 경로와 수신 경로는 각자의 라운드 로빈 커서를 가진다.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info};

use crate::{Error, Result};

/// 소켓 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 송신 전용
    Send,
    /// 수신 전용
    Receive,
    /// 송수신 (duplex)
    Both,
}

impl Role {
    /// 소켓 식별자에 역할과 송신/수신 목록 내 인덱스를 배정
    ///
    /// - duplex 또는 소켓 1개: 모든 소켓이 양방향, 같은 인덱스
    /// - simplex: id < N/2 송신 전용, id >= N/2 수신 전용 (인덱스 id - N/2)
    pub fn assign(socket_id: usize, sockets: usize, duplex: bool) -> Result<(Role, usize)> {
        if socket_id >= sockets {
            return Err(Error::Protocol(format!(
                "소켓 식별자 {}가 소켓 수 {} 범위 밖",
                socket_id, sockets
            )));
        }
        if duplex || sockets == 1 {
            return Ok((Role::Both, socket_id));
        }
        if sockets % 2 != 0 {
            return Err(Error::Protocol(format!(
                "simplex 모드에서 소켓 수가 홀수: {}",
                sockets
            )));
        }

        let half = sockets / 2;
        if socket_id < half {
            Ok((Role::Send, socket_id))
        } else {
            Ok((Role::Receive, socket_id - half))
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Send => "Out",
            Role::Receive => "In",
            Role::Both => "Out&In",
        }
    }
}

/// 라운드 로빈 커서
///
/// 호출마다 다음 인덱스를 반환하고 길이에 도달하면 0으로 돌아간다
#[derive(Debug)]
pub struct RoundRobin {
    cursor: AtomicUsize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            len,
        }
    }

    pub fn next(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| {
                Some(if i + 1 >= self.len { 0 } else { i + 1 })
            })
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 송신용 소켓 (write half)
#[derive(Debug)]
pub(crate) struct SendSocket {
    pub(crate) id: usize,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
}

/// 수신용 소켓 (read half)
#[derive(Debug)]
pub(crate) struct RecvSocket {
    pub(crate) id: usize,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    /// 수신 전용 소켓의 write half.
    /// drop 하면 FIN이 나가므로 풀이 닫힐 때까지 보관
    idle_writer: Mutex<Option<OwnedWriteHalf>>,
}

/// 핸드쉐이크 중 소켓을 배치하는 빌더
#[derive(Debug)]
pub struct PoolBuilder {
    sockets: usize,
    duplex: bool,
    send: Vec<Option<SendSocket>>,
    recv: Vec<Option<RecvSocket>>,
    placed: Vec<bool>,
}

impl PoolBuilder {
    /// 협상된 소켓 수와 duplex 여부로 생성
    pub fn new(sockets: usize, duplex: bool) -> Result<Self> {
        if sockets == 0 {
            return Err(Error::Protocol("협상된 소켓 수가 0".into()));
        }
        let duplex = duplex || sockets == 1;
        if !duplex && sockets % 2 != 0 {
            return Err(Error::Protocol(format!(
                "simplex 모드에서 소켓 수가 홀수: {}",
                sockets
            )));
        }

        let lane = if duplex { sockets } else { sockets / 2 };
        Ok(Self {
            sockets,
            duplex,
            send: (0..lane).map(|_| None).collect(),
            recv: (0..lane).map(|_| None).collect(),
            placed: vec![false; sockets],
        })
    }

    pub fn sockets(&self) -> usize {
        self.sockets
    }

    pub fn is_duplex(&self) -> bool {
        self.duplex
    }

    /// 소켓 배치
    pub fn add_socket(&mut self, socket_id: usize, stream: TcpStream) -> Result<Role> {
        let (role, index) = Role::assign(socket_id, self.sockets, self.duplex)?;
        if self.placed[socket_id] {
            return Err(Error::Protocol(format!("소켓 식별자 {} 중복", socket_id)));
        }

        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();
        match role {
            Role::Send => {
                // read half는 drop 해도 연결에 영향 없음
                drop(reader);
                self.send[index] = Some(SendSocket::new(socket_id, writer));
            }
            Role::Receive => {
                self.recv[index] = Some(RecvSocket::new(socket_id, reader, Some(writer)));
            }
            Role::Both => {
                self.send[index] = Some(SendSocket::new(socket_id, writer));
                self.recv[index] = Some(RecvSocket::new(socket_id, reader, None));
            }
        }
        self.placed[socket_id] = true;

        info!(
            "Socket {} placed: type={} index={} local={:?}",
            socket_id,
            role.label(),
            index,
            local_addr
        );
        Ok(role)
    }

    /// 모든 소켓이 배치되었는지 확인 후 풀 생성
    pub fn build(self, io_timeout: Option<Duration>) -> Result<SocketPool> {
        if let Some(missing) = self.placed.iter().position(|p| !p) {
            return Err(Error::Protocol(format!(
                "소켓 식별자 {}가 배치되지 않음",
                missing
            )));
        }

        let send: Vec<SendSocket> = self.send.into_iter().flatten().collect();
        let recv: Vec<RecvSocket> = self.recv.into_iter().flatten().collect();
        let (closed, _) = watch::channel(false);

        Ok(SocketPool {
            sockets: self.sockets,
            duplex: self.duplex,
            send_cursor: RoundRobin::new(send.len()),
            recv_cursor: RoundRobin::new(recv.len()),
            send,
            recv,
            io_timeout,
            closed,
            fault: Mutex::new(None),
        })
    }
}

impl SendSocket {
    fn new(id: usize, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            writer: AsyncMutex::new(Some(writer)),
        }
    }
}

impl RecvSocket {
    fn new(
        id: usize,
        reader: OwnedReadHalf,
        idle_writer: Option<OwnedWriteHalf>,
    ) -> Self {
        Self {
            id,
            reader: AsyncMutex::new(Some(reader)),
            idle_writer: Mutex::new(idle_writer),
        }
    }
}

/// 연결된 소켓 풀
///
/// 에러가 한 번 기록되면 (`abort`) 모든 소켓을 닫고 이후 호출은
/// `Error::SessionAborted`로 즉시 실패한다. 새 연결이 필요하다.
#[derive(Debug)]
pub struct SocketPool {
    sockets: usize,
    duplex: bool,
    send: Vec<SendSocket>,
    recv: Vec<RecvSocket>,
    send_cursor: RoundRobin,
    recv_cursor: RoundRobin,
    io_timeout: Option<Duration>,
    /// true가 되면 진행 중인 I/O도 중단
    closed: watch::Sender<bool>,
    /// 처음 기록된 에러 (단조)
    fault: Mutex<Option<String>>,
}

impl SocketPool {
    /// 전체 소켓 수
    pub fn sockets(&self) -> usize {
        self.sockets
    }

    pub fn is_duplex(&self) -> bool {
        self.duplex
    }

    pub fn send_sockets(&self) -> usize {
        self.send.len()
    }

    pub fn receive_sockets(&self) -> usize {
        self.recv.len()
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// 다음 송신 소켓 (라운드 로빈)
    pub(crate) fn next_send_socket(&self) -> Result<(usize, &SendSocket)> {
        let index = self.send_cursor.next();
        self.send
            .get(index)
            .map(|s| (index, s))
            .ok_or_else(|| Error::Protocol("송신 소켓 없음".into()))
    }

    /// 다음 수신 소켓 (라운드 로빈)
    pub(crate) fn next_receive_socket(&self) -> Result<(usize, &RecvSocket)> {
        let index = self.recv_cursor.next();
        self.recv
            .get(index)
            .map(|s| (index, s))
            .ok_or_else(|| Error::Protocol("수신 소켓 없음".into()))
    }

    pub(crate) fn send_socket(&self, index: usize) -> Option<&SendSocket> {
        self.send.get(index)
    }

    pub(crate) fn receive_socket(&self, index: usize) -> Option<&RecvSocket> {
        self.recv.get(index)
    }

    /// 커서 초기화
    pub fn reset_cursors(&self) {
        self.send_cursor.reset();
        self.recv_cursor.reset();
    }

    /// 이전 에러가 있으면 SessionAborted
    pub fn check(&self) -> Result<()> {
        if self.fault.lock().is_some() || *self.closed.borrow() {
            return Err(self.aborted_error());
        }
        Ok(())
    }

    /// 기록된 에러 메시지
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 에러 기록 후 모든 소켓 강제 종료
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                error!("ERROR: {}", reason);
                *fault = Some(reason);
            }
        }
        self.close_all();
    }

    /// 모든 소켓 닫기
    ///
    /// 진행 중인 I/O는 closed 신호로 중단되고, 그 소켓은 풀이 drop 될 때 닫힌다
    pub fn close_all(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        for socket in &self.send {
            if let Ok(mut writer) = socket.writer.try_lock() {
                writer.take();
            }
        }
        for socket in &self.recv {
            if let Ok(mut reader) = socket.reader.try_lock() {
                reader.take();
            }
            socket.idle_writer.lock().take();
        }
        debug!("All sockets closed");
    }

    fn aborted_error(&self) -> Error {
        Error::SessionAborted {
            reason: self
                .fault
                .lock()
                .clone()
                .unwrap_or_else(|| "소켓 닫힘".to_string()),
        }
    }

    /// 타임아웃과 closed 신호를 적용한 I/O
    async fn guarded<F, T>(&self, operation: &'static str, io: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.aborted_error());
        }

        let timed = async {
            match self.io_timeout {
                Some(timeout) => tokio::time::timeout(timeout, io)
                    .await
                    .map_err(|_| Error::Timeout { operation, timeout })?
                    .map_err(Error::from),
                None => io.await.map_err(Error::from),
            }
        };

        tokio::select! {
            result = timed => result,
            _ = async {
                let _ = closed.wait_for(|c| *c).await;
            } => Err(self.aborted_error()),
        }
    }

    /// 전체 기록 (부분 쓰기 재시도)
    pub(crate) async fn write_all(&self, socket: &SendSocket, buf: &[u8]) -> Result<()> {
        let mut guard = socket.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.aborted_error())?;
        self.guarded("send", writer.write_all(buf)).await
    }

    /// 요청 바이트를 모두 읽을 때까지 대기
    pub(crate) async fn read_exact(&self, socket: &RecvSocket, buf: &mut [u8]) -> Result<()> {
        let mut guard = socket.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.aborted_error())?;
        self.guarded("receive", reader.read_exact(buf)).await?;
        Ok(())
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.close_all();
    }
}
