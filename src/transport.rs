//! 블록 전송 경로
//!
//! 한 번의 `send`/`receive` 호출이 블록 하나를 라운드 로빈으로 선택한 소켓에서 처리한다.
//! 핸들은 복제해서 송신 태스크와 수신 태스크가 동시에 사용할 수 있다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::frame::{
    encode_terminate_block, encode_terminate_exit_block, hex_dump, payload_capacity,
    split_into_blocks, BlockFrame,
};
use crate::pool::{RecvSocket, SendSocket, SocketPool};
use crate::sink::{BlockSink, ReceiveReport};
use crate::stats::SessionStats;
use crate::{Error, Result, SessionConfig};

/// 블록 송수신 핸들
#[derive(Debug, Clone)]
pub struct BlockTransport {
    pool: Arc<SocketPool>,
    stats: Arc<SessionStats>,
    block_size: usize,
    delay_send: Duration,
    delay_receive: Duration,
    display_raw: bool,
    exit_on_terminate: bool,
}

impl BlockTransport {
    pub fn new(
        pool: Arc<SocketPool>,
        stats: Arc<SessionStats>,
        block_size: usize,
        config: &SessionConfig,
    ) -> Self {
        Self {
            pool,
            stats,
            block_size,
            delay_send: config.delay_send,
            delay_receive: config.delay_receive,
            display_raw: config.display_raw,
            exit_on_terminate: config.exit_on_terminate,
        }
    }

    /// 협상된 블록 크기
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 블록당 페이로드 용량
    pub fn payload_capacity(&self) -> usize {
        payload_capacity(self.block_size)
    }

    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// 버퍼 하나를 다음 송신 소켓으로 전부 전송
    ///
    /// 이전 에러가 있으면 `Error::SessionAborted`로 즉시 실패
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.pool.check()?;
        let (index, socket) = self.pool.next_send_socket()?;
        self.send_on(index, socket, buf).await
    }

    async fn send_on(&self, index: usize, socket: &SendSocket, buf: &[u8]) -> Result<usize> {
        let started = Instant::now();
        if let Err(e) = self.pool.write_all(socket, buf).await {
            return Err(self.fail("send", socket.id, e));
        }
        self.stats.record_sent(buf.len(), started.elapsed());

        if self.display_raw {
            info!(
                "{}",
                hex_dump(buf, &format!("Send buffer to socket #{} ID: {}", index + 1, socket.id))
            );
        }
        if !self.delay_send.is_zero() {
            tokio::time::sleep(self.delay_send).await;
        }
        Ok(buf.len())
    }

    /// 다음 수신 소켓에서 블록 하나를 수신 (`buf` 앞부분에 기록)
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.pool.check()?;
        if buf.len() < self.block_size {
            return Err(Error::BufferTooSmall {
                needed: self.block_size,
                got: buf.len(),
            });
        }
        let (index, socket) = self.pool.next_receive_socket()?;
        self.receive_on(index, socket, &mut buf[..self.block_size]).await
    }

    async fn receive_on(&self, index: usize, socket: &RecvSocket, block: &mut [u8]) -> Result<usize> {
        let started = Instant::now();
        if let Err(e) = self.pool.read_exact(socket, block).await {
            return Err(self.fail("receive", socket.id, e));
        }
        self.stats.record_received(block.len(), started.elapsed());

        if self.display_raw {
            info!(
                "{}",
                hex_dump(
                    block,
                    &format!("Received buffer from socket #{} ID: {}", index + 1, socket.id)
                )
            );
        }
        if !self.delay_receive.is_zero() {
            tokio::time::sleep(self.delay_receive).await;
        }
        Ok(block.len())
    }

    /// 에러 기록 후 풀 종료
    fn fail(&self, operation: &str, socket_id: usize, err: Error) -> Error {
        if !err.is_aborted() {
            self.pool
                .abort(format!("{} on socket {} failed: {}", operation, socket_id, err));
        }
        err
    }

    /// 임의 길이 데이터를 데이터 블록들로 나눠 전송
    ///
    /// 빈 데이터는 아무것도 보내지 않는다. 반환값은 보낸 데이터 바이트 수
    pub async fn send_payload(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        for block in split_into_blocks(data, self.block_size)? {
            self.send(&block).await?;
        }
        debug!("payload sent: {} bytes", data.len());
        Ok(data.len())
    }

    /// 블록 하나를 받아 데이터 페이로드를 `buf`에 복사
    ///
    /// 반환: (페이로드 길이, 종료 블록 여부). 데이터 블록이 아니면 길이 0
    pub async fn receive_payload(&self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut block = vec![0u8; self.block_size];
        self.receive(&mut block).await?;

        let frame = BlockFrame::parse(&block)?;
        if frame.is_data() {
            let payload = frame.payload()?;
            if payload.len() > buf.len() {
                return Err(Error::BufferTooSmall {
                    needed: payload.len(),
                    got: buf.len(),
                });
            }
            buf[..payload.len()].copy_from_slice(payload);
            return Ok((payload.len(), false));
        }
        Ok((0, frame.is_terminal()))
    }

    /// 모든 송신 소켓에 terminate 블록 전송
    ///
    /// `exit_on_terminate`면 exit + terminate
    pub async fn send_terminate(&self) -> Result<usize> {
        if self.exit_on_terminate {
            return self.send_terminate_exit().await;
        }
        let block = encode_terminate_block(self.block_size)?;
        let sent = self.broadcast(&block).await?;
        info!("The terminate command is sent.");
        Ok(sent)
    }

    /// 모든 송신 소켓에 exit + terminate 블록 전송
    pub async fn send_terminate_exit(&self) -> Result<usize> {
        let block = encode_terminate_exit_block(self.block_size)?;
        let sent = self.broadcast(&block).await?;
        info!("The terminate and exit commands is sent.");
        Ok(sent)
    }

    /// 송신 소켓마다 1회
    async fn broadcast(&self, block: &[u8]) -> Result<usize> {
        self.pool.check()?;
        let mut sent = 0;
        for index in 0..self.pool.send_sockets() {
            let Some(socket) = self.pool.send_socket(index) else {
                break;
            };
            sent += self.send_on(index, socket, block).await?;
        }
        Ok(sent)
    }

    /// 종료 블록까지 데이터 페이로드를 모아 반환
    ///
    /// `capacity`를 넘으면 `BufferTooSmall`
    pub async fn receive_all(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut block = vec![0u8; self.block_size];
        loop {
            self.receive(&mut block).await?;
            let frame = BlockFrame::parse(&block)?;
            if frame.is_data() {
                let payload = frame.payload()?;
                if out.len() + payload.len() > capacity {
                    return Err(Error::BufferTooSmall {
                        needed: out.len() + payload.len(),
                        got: capacity,
                    });
                }
                out.extend_from_slice(payload);
            } else if frame.is_terminal() {
                return Ok(out);
            }
        }
    }

    /// 종료 블록까지 수신하며 싱크로 전달
    pub async fn receive_into<S: BlockSink + ?Sized>(&self, sink: &mut S) -> Result<ReceiveReport> {
        let mut report = ReceiveReport::default();
        let mut block = vec![0u8; self.block_size];
        loop {
            self.receive(&mut block).await?;
            sink.on_block(&block)?;

            let frame = BlockFrame::parse(&block)?;
            if frame.is_terminal() {
                info!("Terminate tag is received.");
                report.terminated = true;
                break;
            }
            if frame.is_data() {
                let payload = frame.payload()?;
                sink.on_payload(payload)?;
                report.payload_bytes += payload.len() as u64;
            } else if frame.data_type().is_none() {
                warn!("Unknown block type {:#x} ignored", frame.raw_type());
            }
            report.blocks += 1;
        }
        sink.finish()?;
        Ok(report)
    }
}
