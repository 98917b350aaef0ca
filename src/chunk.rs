//! 청크 전송
//!
//! 블록 헤더 없이 하나의 바이트 스트림 위에 논리 단위를 연속으로 보낸다.
//!
//! ```text
//! [dataSize: u64][tag: u64][data ... dataSize][패딩]
//! ```
//!
//! - 송신: 첫 `send_data_block`에서 헤더 전송, 데이터 전송 후 패딩 → AllData
//! - 수신: 헤더 수신 → DataProcessing, 데이터를 다 읽으면 패딩을 비우고 바로 다음 헤더 수신

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::ChunkFramingMode;
use crate::frame::{pad_to_block, pad_to_word, ChunkHeader, ControlTag, DataType, CHUNK_HEADER_SIZE};
use crate::pool::SocketPool;
use crate::stats::SessionStats;
use crate::{Error, Result, WORD_SIZE};

/// 패딩 폐기용 버퍼 크기
const DISCARD_CHUNK: usize = 4096;

/// 청크 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// 알 수 없는 태그 수신
    UnsupportedTag,
    /// I/O 또는 형식 에러
    Error,
    /// 데이터 송수신 중
    DataProcessing,
    /// 데이터 뒤 패딩 처리 중
    DataPadding,
    /// 선언된 데이터 전부 처리
    AllData,
    /// 데이터를 다 받기 전에 terminate 수신 (전송 중단)
    Termination,
    /// AllData 후 terminate 수신 (정상 종료)
    Finish,
}

/// 블록 프레이밍 없는 원시 I/O
pub trait RawIo {
    /// 버퍼 전체 송신
    fn send_exact(&mut self, buf: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// 버퍼를 채울 때까지 수신
    fn recv_exact(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send;
}

/// tokio 스트림 어댑터
#[derive(Debug)]
pub struct StreamIo<S> {
    inner: S,
}

impl<S> StreamIo<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> RawIo for StreamIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_exact(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).await?;
        Ok(())
    }
}

/// 세션 소켓 풀 위의 청크 채널
///
/// 바이트 순서를 유지하기 위해 송신 소켓 0과 수신 소켓 0만 사용
#[derive(Debug, Clone)]
pub struct ChunkChannel {
    pool: Arc<SocketPool>,
    stats: Arc<SessionStats>,
}

impl ChunkChannel {
    pub(crate) fn new(pool: Arc<SocketPool>, stats: Arc<SessionStats>) -> Self {
        Self { pool, stats }
    }

    fn fail(&self, operation: &str, err: Error) -> Error {
        if !err.is_aborted() {
            self.pool.abort(format!("chunk {} failed: {}", operation, err));
        }
        err
    }
}

impl RawIo for ChunkChannel {
    async fn send_exact(&mut self, buf: &[u8]) -> Result<()> {
        self.pool.check()?;
        let socket = self
            .pool
            .send_socket(0)
            .ok_or_else(|| Error::Protocol("송신 소켓 없음".into()))?;

        let started = Instant::now();
        self.pool
            .write_all(socket, buf)
            .await
            .map_err(|e| self.fail("send", e))?;
        self.stats.record_sent(buf.len(), started.elapsed());
        Ok(())
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.pool.check()?;
        let socket = self
            .pool
            .receive_socket(0)
            .ok_or_else(|| Error::Protocol("수신 소켓 없음".into()))?;

        let started = Instant::now();
        self.pool
            .read_exact(socket, buf)
            .await
            .map_err(|e| self.fail("receive", e))?;
        self.stats.record_received(buf.len(), started.elapsed());
        Ok(())
    }
}

/// 청크 헤더와 데이터 뒤 패딩 규칙
pub trait ChunkFraming: Send + Sync {
    /// 데이터 청크 헤더
    fn header(&self, data_size: u64) -> ChunkHeader {
        ChunkHeader::data(data_size)
    }

    /// 데이터 뒤에 붙일 패딩 바이트 수
    fn trailer_len(&self, data_size: u64) -> usize;
}

/// 8바이트 경계까지만 패딩
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkFrames;

impl ChunkFraming for ChunkFrames {
    fn trailer_len(&self, data_size: u64) -> usize {
        pad_to_word(data_size)
    }
}

/// 블록 경계 패딩 후 8바이트 경계 패딩 (`ReceiveChunks`가 비우는 양과 같음)
#[derive(Debug, Clone, Copy)]
pub struct BlockFrames {
    pub block_size: usize,
}

impl ChunkFraming for BlockFrames {
    fn trailer_len(&self, data_size: u64) -> usize {
        pad_to_block(data_size, self.block_size) + pad_to_word(data_size)
    }
}

/// 설정에 맞는 프레이밍
pub fn framing_for(mode: ChunkFramingMode, block_size: usize) -> Box<dyn ChunkFraming> {
    match mode {
        ChunkFramingMode::Chunks => Box::new(ChunkFrames),
        ChunkFramingMode::Blocks => Box::new(BlockFrames { block_size }),
    }
}

/// 청크 송신기
pub struct SendChunks<'a, I: RawIo> {
    io: &'a mut I,
    framing: Box<dyn ChunkFraming>,
    data_size: u64,
    sent: u64,
    header_sent: bool,
    status: ChunkStatus,
}

impl<'a, I: RawIo> SendChunks<'a, I> {
    /// 8바이트 패딩 청크 송신기
    pub fn new(io: &'a mut I, data_size: u64) -> Self {
        Self::with_framing(io, data_size, Box::new(ChunkFrames))
    }

    /// 블록 정렬 청크 송신기
    pub fn blocks(io: &'a mut I, data_size: u64, block_size: usize) -> Self {
        Self::with_framing(io, data_size, Box::new(BlockFrames { block_size }))
    }

    pub fn with_framing(io: &'a mut I, data_size: u64, framing: Box<dyn ChunkFraming>) -> Self {
        Self {
            io,
            framing,
            data_size,
            sent: 0,
            header_sent: false,
            status: ChunkStatus::DataProcessing,
        }
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// 남은 데이터 바이트
    pub fn remaining(&self) -> u64 {
        self.data_size - self.sent
    }

    async fn send_header(&mut self) -> Result<()> {
        let header = self.framing.header(self.data_size).encode()?;
        self.io.send_exact(&header).await?;
        self.header_sent = true;
        debug!("chunk header sent: {} bytes declared", self.data_size);
        Ok(())
    }

    async fn send_trailer(&mut self) -> Result<()> {
        self.status = ChunkStatus::DataPadding;
        let len = self.framing.trailer_len(self.data_size);
        if len > 0 {
            self.io.send_exact(&vec![0u8; len]).await?;
        }
        self.status = ChunkStatus::AllData;
        Ok(())
    }

    /// 데이터 조각 송신
    ///
    /// 선언된 크기를 넘는 부분은 보내지 않는다. 반환값은 보낸 바이트 수
    pub async fn send_data_block(&mut self, data: &[u8]) -> Result<usize> {
        match self.status {
            ChunkStatus::DataProcessing => {}
            ChunkStatus::AllData => {
                return Err(Error::Protocol("청크 데이터를 이미 모두 전송함".into()));
            }
            other => {
                return Err(Error::Protocol(format!("청크 송신 불가 상태: {:?}", other)));
            }
        }

        let result = self.send_piece(data).await;
        if result.is_err() {
            self.status = ChunkStatus::Error;
        }
        result
    }

    async fn send_piece(&mut self, data: &[u8]) -> Result<usize> {
        if !self.header_sent {
            self.send_header().await?;
        }

        let n = data.len().min(self.remaining() as usize);
        if n < data.len() {
            warn!(
                "chunk data exceeds declared size, {} bytes dropped",
                data.len() - n
            );
        }
        if n > 0 {
            self.io.send_exact(&data[..n]).await?;
            self.sent += n as u64;
        }

        if self.remaining() == 0 {
            self.send_trailer().await?;
        }
        Ok(n)
    }

    /// 크기 0 청크 등 데이터 없이 마무리
    pub async fn finish(&mut self) -> Result<()> {
        if self.status == ChunkStatus::AllData {
            return Ok(());
        }
        if self.remaining() > 0 {
            return Err(Error::TruncatedTransfer {
                declared: self.data_size,
                received: self.sent,
            });
        }
        self.send_data_block(&[]).await.map(|_| ())
    }
}

/// 서비스 청크 {8, service, terminate} 송신
pub async fn send_chunk_terminate<I: RawIo>(io: &mut I) -> Result<()> {
    let mut buf = ChunkHeader::service().encode()?;
    buf.extend_from_slice(&ControlTag::TERMINATE.to_le_bytes());
    io.send_exact(&buf).await?;
    info!("Chunk terminate sent.");
    Ok(())
}

/// 청크 수신기
pub struct ReceiveChunks<'a, I: RawIo> {
    io: &'a mut I,
    block_size: usize,
    data_size: u64,
    received: u64,
    status: ChunkStatus,
    /// AllData에 도달한 논리 단위들의 선언 크기
    completed: Vec<u64>,
}

impl<'a, I: RawIo> ReceiveChunks<'a, I> {
    /// 첫 헤더까지 수신
    ///
    /// `block_size`가 0이면 블록 경계 패딩을 비우지 않는다
    pub async fn new(io: &'a mut I, block_size: usize) -> Result<Self> {
        let mut receiver = Self {
            io,
            block_size,
            data_size: 0,
            received: 0,
            status: ChunkStatus::DataProcessing,
            completed: Vec::new(),
        };
        receiver.read_header().await?;
        Ok(receiver)
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    /// 현재 논리 단위의 선언 크기
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// 현재 논리 단위에서 받은 바이트
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.data_size - self.received
    }

    /// 완료된 논리 단위들의 선언 크기 (순서대로)
    pub fn completed_units(&self) -> &[u64] {
        &self.completed
    }

    /// 전송이 정상 종료되었는지 확인
    ///
    /// Termination이면 `TruncatedTransfer`
    pub fn check_complete(&self) -> Result<()> {
        match self.status {
            ChunkStatus::Finish | ChunkStatus::AllData => Ok(()),
            ChunkStatus::Termination => Err(Error::TruncatedTransfer {
                declared: self.data_size,
                received: self.received,
            }),
            other => Err(Error::Protocol(format!("청크 전송 미완료: {:?}", other))),
        }
    }

    /// AllData 상태에서 다음 헤더 수신
    pub async fn next_unit(&mut self) -> Result<ChunkStatus> {
        if self.status == ChunkStatus::AllData {
            self.read_header().await?;
        }
        Ok(self.status)
    }

    /// 헤더 수신 후 상태 전이
    ///
    /// 크기 0 데이터 청크는 바로 정리하고 다음 헤더로 넘어간다
    async fn read_header(&mut self) -> Result<()> {
        let result = self.read_header_inner().await;
        self.mark_error(&result);
        result
    }

    async fn read_header_inner(&mut self) -> Result<()> {
        loop {
            let mut buf = [0u8; CHUNK_HEADER_SIZE];
            self.recv_header_part(&mut buf, "청크 헤더").await?;
            let header = ChunkHeader::decode(&buf)?;

            match header.data_type() {
                Some(DataType::Service) => {
                    let mut word = [0u8; WORD_SIZE];
                    self.recv_header_part(&mut word, "청크 컨트롤 워드").await?;
                    let tag = u64::from_le_bytes(word);
                    if tag != ControlTag::TERMINATE {
                        self.status = ChunkStatus::UnsupportedTag;
                        return Err(Error::Protocol(format!(
                            "지원하지 않는 청크 컨트롤 태그: {:#x}",
                            tag
                        )));
                    }
                    if self.status == ChunkStatus::AllData {
                        info!("Finish received.");
                        self.status = ChunkStatus::Finish;
                    } else {
                        warn!(
                            "Termination received: {} of {} bytes",
                            self.received, self.data_size
                        );
                        self.status = ChunkStatus::Termination;
                    }
                    return Ok(());
                }
                Some(DataType::Padding) => {
                    self.status = ChunkStatus::DataPadding;
                    self.discard(header.data_size as usize).await?;
                    self.status = ChunkStatus::AllData;
                    return Ok(());
                }
                Some(DataType::Data) => {
                    self.data_size = header.data_size;
                    self.received = 0;
                    self.status = ChunkStatus::DataProcessing;
                    debug!("chunk header received: {} bytes declared", self.data_size);
                    if self.data_size > 0 {
                        return Ok(());
                    }
                    self.drain_unit().await?;
                }
                None => {
                    self.status = ChunkStatus::UnsupportedTag;
                    return Err(Error::Protocol(format!(
                        "지원하지 않는 청크 태그: {:#x}",
                        header.tag
                    )));
                }
            }
        }
    }

    /// 헤더 영역 수신 (스트림이 중간에 끝나면 프로토콜 에러)
    async fn recv_header_part(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        match self.io.recv_exact(buf).await {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::Protocol(format!(
                    "{} 길이 부족: {} bytes 필요",
                    what,
                    buf.len()
                )))
            }
            other => other,
        }
    }

    async fn discard(&mut self, mut len: usize) -> Result<()> {
        let mut buf = vec![0u8; len.min(DISCARD_CHUNK)];
        while len > 0 {
            let n = len.min(buf.len());
            self.io.recv_exact(&mut buf[..n]).await?;
            len -= n;
        }
        Ok(())
    }

    /// 논리 단위 뒤 패딩 비우기 → AllData
    async fn drain_unit(&mut self) -> Result<()> {
        self.status = ChunkStatus::DataPadding;
        let padding = pad_to_block(self.data_size, self.block_size) + pad_to_word(self.data_size);
        self.discard(padding).await?;

        self.completed.push(self.data_size);
        self.status = ChunkStatus::AllData;
        info!("All data is read: {} bytes", self.data_size);
        Ok(())
    }

    fn mark_error<T>(&mut self, result: &Result<T>) {
        if result.is_err() && self.status != ChunkStatus::UnsupportedTag {
            self.status = ChunkStatus::Error;
        }
    }

    /// 현재 논리 단위에서 최대 `length` 바이트 수신
    ///
    /// 논리 단위를 다 읽으면 패딩을 비우고 다음 헤더까지 수신한다
    pub async fn receive_data_block(&mut self, buf: &mut [u8], length: usize) -> Result<usize> {
        match self.status {
            ChunkStatus::DataProcessing => {}
            ChunkStatus::AllData | ChunkStatus::Finish => return Ok(0),
            ChunkStatus::Termination => {
                return Err(Error::TruncatedTransfer {
                    declared: self.data_size,
                    received: self.received,
                });
            }
            other => {
                return Err(Error::Protocol(format!("청크 수신 불가 상태: {:?}", other)));
            }
        }

        let n = length.min(buf.len()).min(self.remaining() as usize);
        let result = self.io.recv_exact(&mut buf[..n]).await;
        self.mark_error(&result);
        result?;
        self.received += n as u64;

        if self.remaining() == 0 {
            let drained = self.drain_unit().await;
            self.mark_error(&drained);
            drained?;
            self.read_header().await?;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(bytes: Vec<u8>) -> StreamIo<Cursor<Vec<u8>>> {
        StreamIo::new(Cursor::new(bytes))
    }

    fn data_unit(out: &mut Vec<u8>, data: &[u8], padding: usize) {
        out.extend_from_slice(&ChunkHeader::data(data.len() as u64).encode().unwrap());
        out.extend_from_slice(data);
        out.extend(std::iter::repeat(0xEEu8).take(padding));
    }

    fn terminate(out: &mut Vec<u8>) {
        out.extend_from_slice(&ChunkHeader::service().encode().unwrap());
        out.extend_from_slice(&ControlTag::TERMINATE.to_le_bytes());
    }

    async fn drain_units<I: RawIo>(rx: &mut ReceiveChunks<'_, I>) -> Vec<Vec<u8>> {
        let mut units = Vec::new();
        let mut current = Vec::new();
        let mut buf = [0u8; 7];
        while rx.status() == ChunkStatus::DataProcessing {
            let n = rx.receive_data_block(&mut buf, 7).await.unwrap();
            current.extend_from_slice(&buf[..n]);
            if rx.completed_units().len() > units.len() {
                units.push(std::mem::take(&mut current));
            }
        }
        units
    }

    #[tokio::test]
    async fn test_chained_units_consume_block_and_word_padding() {
        // 10 bytes: 블록 패딩 102 + 워드 패딩 6, 20 bytes: 92 + 4
        let mut stream = Vec::new();
        data_unit(&mut stream, &[1u8; 10], 102 + 6);
        data_unit(&mut stream, &[2u8; 20], 92 + 4);
        terminate(&mut stream);

        let mut io = reader(stream);
        let mut rx = ReceiveChunks::new(&mut io, 128).await.unwrap();
        assert_eq!(rx.status(), ChunkStatus::DataProcessing);
        assert_eq!(rx.data_size(), 10);

        let units = drain_units(&mut rx).await;
        assert_eq!(rx.completed_units(), &[10, 20]);
        assert_eq!(units, vec![vec![1u8; 10], vec![2u8; 20]]);
        assert_eq!(rx.status(), ChunkStatus::Finish);
        assert!(rx.check_complete().is_ok());
    }

    #[tokio::test]
    async fn test_terminate_before_data_is_truncation() {
        let mut stream = Vec::new();
        terminate(&mut stream);

        let mut io = reader(stream);
        let mut rx = ReceiveChunks::new(&mut io, 128).await.unwrap();
        assert_eq!(rx.status(), ChunkStatus::Termination);
        assert!(matches!(
            rx.check_complete(),
            Err(Error::TruncatedTransfer { .. })
        ));

        let mut buf = [0u8; 8];
        assert!(matches!(
            rx.receive_data_block(&mut buf, 8).await,
            Err(Error::TruncatedTransfer { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_tag() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&8u64.to_le_bytes());
        stream.extend_from_slice(&7u64.to_le_bytes());

        let mut io = reader(stream);
        assert!(matches!(
            ReceiveChunks::new(&mut io, 128).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_short_header_is_protocol_error() {
        let mut io = reader(vec![0u8; 10]);
        let err = ReceiveChunks::new(&mut io, 128).await.err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);

        // 서비스 헤더 뒤 컨트롤 워드가 잘린 경우
        let mut stream = ChunkHeader::service().encode().unwrap();
        stream.extend_from_slice(&[0xB2, 0x9E, 0x43]);
        let mut io = reader(stream);
        let err = ReceiveChunks::new(&mut io, 128).await.err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_padding_chunk_discarded() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&24u64.to_le_bytes());
        stream.extend_from_slice(&DataType::Padding.as_word().to_le_bytes());
        stream.extend_from_slice(&[0u8; 24]);
        terminate(&mut stream);

        let mut io = reader(stream);
        let mut rx = ReceiveChunks::new(&mut io, 128).await.unwrap();
        assert_eq!(rx.status(), ChunkStatus::AllData);
        assert_eq!(rx.next_unit().await.unwrap(), ChunkStatus::Finish);
    }

    #[tokio::test]
    async fn test_send_chunks_pads_to_word() {
        let mut io = StreamIo::new(Cursor::new(Vec::new()));
        let mut tx = SendChunks::new(&mut io, 10);
        assert_eq!(tx.status(), ChunkStatus::DataProcessing);

        assert_eq!(tx.send_data_block(&[9u8; 4]).await.unwrap(), 4);
        assert_eq!(tx.send_data_block(&[9u8; 8]).await.unwrap(), 6);
        assert_eq!(tx.status(), ChunkStatus::AllData);
        assert!(tx.send_data_block(&[1]).await.is_err());

        let bytes = io.into_inner().into_inner();
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE + 10 + 6);
        assert_eq!(ChunkHeader::decode(&bytes).unwrap(), ChunkHeader::data(10));
        assert!(bytes[26..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_send_blocks_matches_receiver_drain() {
        let mut io = StreamIo::new(Cursor::new(Vec::new()));
        for (size, value) in [(10u64, 3u8), (20, 4)] {
            let mut tx = SendChunks::blocks(&mut io, size, 128);
            tx.send_data_block(&vec![value; size as usize]).await.unwrap();
            assert_eq!(tx.status(), ChunkStatus::AllData);
        }
        send_chunk_terminate(&mut io).await.unwrap();

        let bytes = io.into_inner().into_inner();
        assert_eq!(bytes.len(), (16 + 10 + 102 + 6) + (16 + 20 + 92 + 4) + 24);

        let mut io = reader(bytes);
        let mut rx = ReceiveChunks::new(&mut io, 128).await.unwrap();
        let units = drain_units(&mut rx).await;
        assert_eq!(units, vec![vec![3u8; 10], vec![4u8; 20]]);
        assert_eq!(rx.status(), ChunkStatus::Finish);
    }

    #[tokio::test]
    async fn test_zero_size_chunk() {
        let mut io = StreamIo::new(Cursor::new(Vec::new()));
        let mut tx = SendChunks::new(&mut io, 0);
        tx.finish().await.unwrap();
        assert_eq!(tx.status(), ChunkStatus::AllData);
        send_chunk_terminate(&mut io).await.unwrap();

        let mut io = reader(io.into_inner().into_inner());
        let rx = ReceiveChunks::new(&mut io, 0).await.unwrap();
        assert_eq!(rx.completed_units(), &[0]);
        assert_eq!(rx.status(), ChunkStatus::Finish);
    }

    #[test]
    fn test_framing_for_mode() {
        assert_eq!(framing_for(ChunkFramingMode::Chunks, 128).trailer_len(10), 6);
        assert_eq!(framing_for(ChunkFramingMode::Blocks, 128).trailer_len(10), 108);
    }
}
