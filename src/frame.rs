//! 와이어 포맷 (블록 프레임, 컨트롤 프레임, 청크 헤더)
//!
//! 모든 정수는 8바이트 little-endian 워드
//!
//! ```text
//! Block:  [word0: 길이][word1: 타입][payload / 컨트롤 필드 ... 블록 크기까지 패딩]
//! Chunk:  [dataSize: u64][tag: u64][data ...][8바이트 경계 패딩]
//! ```

use std::fmt;
use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::validate_block_size;
use crate::{Error, Result, BLOCK_HEADER_SIZE, SOCKET_CONFIG_SIZE, WORD_SIZE};

/// 블록/청크 데이터 타입 (word1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DataType {
    Data = 0x00,
    Service = 0x01,
    Padding = 0x02,
}

impl DataType {
    pub fn from_word(word: u64) -> Option<Self> {
        match word {
            0x00 => Some(DataType::Data),
            0x01 => Some(DataType::Service),
            0x02 => Some(DataType::Padding),
            _ => None,
        }
    }

    pub fn as_word(self) -> u64 {
        self as u64
    }
}

/// 서비스 블록 컨트롤 태그 (word2, word3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    Exit,
    SocketConfig,
    Terminate,
}

impl ControlTag {
    pub const EXIT: u64 = 0x01;
    pub const SOCKET_CONFIG: u64 = 0x02;
    pub const TERMINATE: u64 = 0xFFFF_FFFF_FF43_9EB2;

    pub fn as_word(self) -> u64 {
        match self {
            ControlTag::Exit => Self::EXIT,
            ControlTag::SocketConfig => Self::SOCKET_CONFIG,
            ControlTag::Terminate => Self::TERMINATE,
        }
    }

    pub fn from_word(word: u64) -> Option<Self> {
        match word {
            Self::EXIT => Some(ControlTag::Exit),
            Self::SOCKET_CONFIG => Some(ControlTag::SocketConfig),
            Self::TERMINATE => Some(ControlTag::Terminate),
            _ => None,
        }
    }
}

/// 프로토콜 버전 (8비트 4개, 상위 바이트부터 표시)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u64);

impl ProtocolVersion {
    pub fn components(self) -> [u8; 4] {
        let bytes = self.0.to_le_bytes();
        [bytes[3], bytes[2], bytes[1], bytes[0]]
    }

    /// 최소 버전 이상인지
    pub fn is_supported(self, minimum: ProtocolVersion) -> bool {
        self >= minimum
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.components();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// n번째 워드 읽기 (호출 전 길이 확인 필요)
#[inline]
pub(crate) fn word_at(buf: &[u8], index: usize) -> u64 {
    let mut slice = &buf[index * WORD_SIZE..(index + 1) * WORD_SIZE];
    slice.get_u64_le()
}

/// 블록 내 페이로드 최대 크기
pub fn payload_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(BLOCK_HEADER_SIZE)
}

/// 데이터 블록 인코딩
///
/// payload는 `block_size - 16` 이하여야 하며 나머지는 0으로 채운다
pub fn encode_data_block(payload: &[u8], block_size: usize) -> Result<Bytes> {
    validate_block_size(block_size)?;
    let capacity = payload_capacity(block_size);
    if payload.len() > capacity {
        return Err(Error::BufferTooSmall {
            needed: payload.len(),
            got: capacity,
        });
    }

    let mut buf = BytesMut::with_capacity(block_size);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u64_le(DataType::Data.as_word());
    buf.put_slice(payload);
    buf.resize(block_size, 0);
    Ok(buf.freeze())
}

/// 서비스(컨트롤) 블록 인코딩
///
/// word0 = 태그 수 * 8, word2부터 태그
pub fn encode_control_block(tags: &[ControlTag], block_size: usize) -> Result<Bytes> {
    validate_block_size(block_size)?;
    if BLOCK_HEADER_SIZE + tags.len() * WORD_SIZE > block_size {
        return Err(Error::BufferTooSmall {
            needed: BLOCK_HEADER_SIZE + tags.len() * WORD_SIZE,
            got: block_size,
        });
    }

    let mut buf = BytesMut::with_capacity(block_size);
    buf.put_u64_le((tags.len() * WORD_SIZE) as u64);
    buf.put_u64_le(DataType::Service.as_word());
    for tag in tags {
        buf.put_u64_le(tag.as_word());
    }
    buf.resize(block_size, 0);
    Ok(buf.freeze())
}

/// terminate 블록
pub fn encode_terminate_block(block_size: usize) -> Result<Bytes> {
    encode_control_block(&[ControlTag::Terminate], block_size)
}

/// exit + terminate 블록
pub fn encode_terminate_exit_block(block_size: usize) -> Result<Bytes> {
    encode_control_block(&[ControlTag::Exit, ControlTag::Terminate], block_size)
}

/// 종료 블록 여부
///
/// 타입이 service이고 word2 또는 word3이 terminate일 때만 true
pub fn is_terminal(block: &[u8]) -> bool {
    if block.len() < 4 * WORD_SIZE {
        return false;
    }
    word_at(block, 1) == DataType::Service.as_word()
        && (word_at(block, 2) == ControlTag::TERMINATE || word_at(block, 3) == ControlTag::TERMINATE)
}

/// 수신된 블록 뷰
#[derive(Debug, Clone, Copy)]
pub struct BlockFrame<'a> {
    buf: &'a [u8],
}

impl<'a> BlockFrame<'a> {
    /// 블록 파싱 (길이는 헤더 이상, 8의 배수)
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE || buf.len() % WORD_SIZE != 0 {
            return Err(Error::Protocol(format!(
                "잘못된 블록 길이: {}",
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    /// word0
    pub fn length(&self) -> u64 {
        word_at(self.buf, 0)
    }

    /// word1 원본값
    pub fn raw_type(&self) -> u64 {
        word_at(self.buf, 1)
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_word(self.raw_type())
    }

    pub fn is_data(&self) -> bool {
        self.raw_type() == DataType::Data.as_word()
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal(self.buf)
    }

    /// n번째 워드 (범위 밖이면 None)
    pub fn word(&self, index: usize) -> Option<u64> {
        if (index + 1) * WORD_SIZE > self.buf.len() {
            return None;
        }
        Some(word_at(self.buf, index))
    }

    /// 서비스 블록의 컨트롤 태그 (word2, word3)
    pub fn control_tags(&self) -> Vec<ControlTag> {
        if self.data_type() != Some(DataType::Service) {
            return Vec::new();
        }
        (2..4)
            .filter_map(|i| self.word(i))
            .filter_map(ControlTag::from_word)
            .collect()
    }

    /// 데이터 블록 페이로드 (word0 바이트)
    pub fn payload(&self) -> Result<&'a [u8]> {
        if !self.is_data() {
            return Err(Error::Protocol(format!(
                "데이터 블록이 아님: type={:#x}",
                self.raw_type()
            )));
        }
        let len = self.length() as usize;
        let capacity = self.buf.len() - BLOCK_HEADER_SIZE;
        if len > capacity {
            return Err(Error::Protocol(format!(
                "선언된 페이로드 길이 {}가 블록 용량 {} 초과",
                len, capacity
            )));
        }
        Ok(&self.buf[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + len])
    }

    /// 블록 전체 바이트
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }
}

/// 데이터를 블록 크기 단위 데이터 블록들로 분할 인코딩
pub fn split_into_blocks(data: &[u8], block_size: usize) -> Result<Vec<Bytes>> {
    validate_block_size(block_size)?;
    data.chunks(payload_capacity(block_size))
        .map(|piece| encode_data_block(piece, block_size))
        .collect()
}

/// 블록들에서 데이터 복원 (종료 블록에서 멈춤)
pub fn join_blocks<'a, I>(blocks: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for block in blocks {
        let frame = BlockFrame::parse(block)?;
        if frame.is_terminal() {
            break;
        }
        if frame.is_data() {
            out.extend_from_slice(frame.payload()?);
        }
    }
    Ok(out)
}

/// socket-config 블록 (서버 → 클라이언트, 소켓마다 1회)
///
/// 블록의 처음 64바이트. 나머지는 블록 크기까지 패딩
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfigFrame {
    /// 뒤따르는 7워드 길이 (56)
    pub length: u64,
    /// service
    pub data_type: u64,
    /// socket-config 태그
    pub tag: u64,
    /// 서버 프로토콜 버전
    pub version: u64,
    /// 소켓 식별자 (0부터)
    pub socket_id: u64,
    /// 협상된 블록 크기
    pub block_size: u64,
    /// 협상된 소켓 수
    pub sockets: u64,
    /// duplex 여부 (1/0)
    pub duplex: u64,
}

impl SocketConfigFrame {
    /// 7워드 (바이트)
    pub const BODY_LENGTH: u64 = (SOCKET_CONFIG_SIZE - WORD_SIZE) as u64;

    pub fn new(version: u64, socket_id: u64, block_size: u64, sockets: u64, duplex: bool) -> Self {
        Self {
            length: Self::BODY_LENGTH,
            data_type: DataType::Service.as_word(),
            tag: ControlTag::SOCKET_CONFIG,
            version,
            socket_id,
            block_size,
            sockets,
            duplex: u64::from(duplex),
        }
    }

    /// 64바이트 인코딩
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// 블록 크기까지 0으로 채운 전체 핸드쉐이크 블록
    pub fn encode_block(&self, block_size: usize) -> Result<Vec<u8>> {
        let mut buf = self.encode()?;
        if block_size < buf.len() {
            return Err(Error::BufferTooSmall {
                needed: buf.len(),
                got: block_size,
            });
        }
        buf.resize(block_size, 0);
        Ok(buf)
    }

    /// 64바이트 디코딩 + 형식 검증
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SOCKET_CONFIG_SIZE {
            return Err(Error::Protocol(format!(
                "socket-config 블록 길이 부족: {}",
                buf.len()
            )));
        }
        let frame: SocketConfigFrame = bincode::deserialize(&buf[..SOCKET_CONFIG_SIZE])?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_type != DataType::Service.as_word() {
            return Err(Error::Protocol(format!(
                "socket-config 블록 타입 불일치: {:#x}",
                self.data_type
            )));
        }
        if self.tag != ControlTag::SOCKET_CONFIG {
            return Err(Error::Protocol(format!(
                "예상하지 못한 컨트롤 태그: {:#x}",
                self.tag
            )));
        }
        if self.length != Self::BODY_LENGTH {
            return Err(Error::Protocol(format!(
                "socket-config 길이 불일치: expected {}, got {}",
                Self::BODY_LENGTH,
                self.length
            )));
        }
        Ok(())
    }

    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion(self.version)
    }

    pub fn is_duplex(&self) -> bool {
        self.duplex == 1
    }
}

/// 청크 헤더 크기
pub const CHUNK_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// 청크 헤더 ([dataSize][tag])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub data_size: u64,
    pub tag: u64,
}

impl ChunkHeader {
    pub fn data(data_size: u64) -> Self {
        Self {
            data_size,
            tag: DataType::Data.as_word(),
        }
    }

    /// 서비스 청크 헤더 (뒤에 컨트롤 워드 1개)
    pub fn service() -> Self {
        Self {
            data_size: WORD_SIZE as u64,
            tag: DataType::Service.as_word(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "청크 헤더 길이 부족: {}",
                buf.len()
            )));
        }
        Ok(bincode::deserialize(&buf[..CHUNK_HEADER_SIZE])?)
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_word(self.tag)
    }
}

/// 8바이트 경계까지 필요한 패딩
pub fn pad_to_word(len: u64) -> usize {
    let rem = (len % WORD_SIZE as u64) as usize;
    if rem == 0 {
        0
    } else {
        WORD_SIZE - rem
    }
}

/// 청크 전체(헤더 포함)를 블록 경계로 맞추는 데 필요한 패딩
pub fn pad_to_block(data_size: u64, block_size: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    let rem = ((data_size + CHUNK_HEADER_SIZE as u64) % block_size as u64) as usize;
    if rem == 0 {
        0
    } else {
        block_size - rem
    }
}

/// 8바이트 단위 hex 덤프
pub fn hex_dump(data: &[u8], title: &str) -> String {
    let mut out = String::with_capacity(data.len() * 3 + title.len() + 48);
    let _ = writeln!(out, "\n{} ({}):", title, data.len());
    out.push_str(&"-".repeat(16));
    out.push('\n');
    for line in data.chunks(WORD_SIZE) {
        for byte in line {
            let _ = write!(out, "{:02x}", byte);
        }
        out.push('\n');
    }
    out.push_str(&"-".repeat(16));
    out
}
