//! 수신 블록 싱크
//!
//! `BlockTransport::receive_into`가 종료 블록까지 받은 블록을 넘겨준다.

use std::io::Write;

use crate::convert::Ds8Header;
use crate::frame::{word_at, BlockFrame};
use crate::{Result, WORD_SIZE};

/// 수신 블록 소비자
pub trait BlockSink {
    /// 수신한 모든 블록 (종료 블록 포함, 원본 그대로)
    fn on_block(&mut self, _block: &[u8]) -> Result<()> {
        Ok(())
    }

    /// 데이터 블록의 페이로드 (word0 바이트)
    fn on_payload(&mut self, payload: &[u8]) -> Result<()>;

    /// 종료 블록 수신 후 1회 호출
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 수신 결과 요약
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// 수신 블록 수 (종료 블록 제외)
    pub blocks: u64,

    /// 데이터 페이로드 바이트 합
    pub payload_bytes: u64,

    /// 종료 블록 수신 여부
    pub terminated: bool,
}

/// 메모리 버퍼
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockSink for MemorySink {
    fn on_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.data.extend_from_slice(payload);
        Ok(())
    }
}

/// 페이로드 바이트를 그대로 기록
pub struct BinSink<W: Write> {
    out: W,
}

impl<W: Write> BinSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> BlockSink for BinSink<W> {
    fn on_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.out.write_all(payload)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// 페이로드를 워드 단위 hex 텍스트로 기록 (한 줄에 16자리)
///
/// 마지막 워드가 덜 찼으면 블록의 나머지 바이트(0)로 채워진 값을 쓴다
pub struct HexSink<W: Write> {
    out: W,
}

impl<W: Write> HexSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> BlockSink for HexSink<W> {
    fn on_block(&mut self, block: &[u8]) -> Result<()> {
        let Ok(frame) = BlockFrame::parse(block) else {
            return Ok(());
        };
        if !frame.is_data() {
            return Ok(());
        }

        let words = (frame.length() as usize).div_ceil(WORD_SIZE);
        let available = block.len() / WORD_SIZE - 2;
        for i in 0..words.min(available) {
            writeln!(self.out, "{:016x}", word_at(block, i + 2))?;
        }
        Ok(())
    }

    fn on_payload(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// ds8 파일: 헤더 후 수신 블록 전체를 그대로 기록
pub struct Ds8Sink<W: Write> {
    out: W,
}

impl<W: Write> Ds8Sink<W> {
    /// 헤더를 바로 기록
    pub fn new(mut out: W, block_size: usize) -> Result<Self> {
        Ds8Header::new(block_size as u32).write_to(&mut out)?;
        Ok(Self { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> BlockSink for Ds8Sink<W> {
    fn on_block(&mut self, block: &[u8]) -> Result<()> {
        self.out.write_all(block)?;
        Ok(())
    }

    fn on_payload(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
