//! 파일 변환기 (bin / hex / ds8)
//!
//! - bin: 원본 바이트
//! - hex: 한 줄에 little-endian u64 워드 하나 (16자리 hex)
//! - ds8: 20바이트 헤더 + 와이어 포맷과 같은 블록들 (마지막은 종료 블록)

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use bytes::BufMut;
use tracing::info;

use crate::config::normalize_block_size;
use crate::frame::{encode_data_block, encode_terminate_block, payload_capacity, BlockFrame};
use crate::{Error, Result, BLOCK_HEADER_SIZE, WORD_SIZE};

/// 마지막 블록의 남는 워드를 채우는 값 ("        ")
pub const SPACE_FILL: u64 = 0x2020_2020_2020_2020;

/// hex 줄 끝 태그
const HEX_TAG: &str = " 02";

/// 파일 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Bin,
    Hex,
    Ds8,
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bin" => Ok(FileType::Bin),
            "hex" => Ok(FileType::Hex),
            "ds8" => Ok(FileType::Ds8),
            other => Err(Error::Config(format!("지원하지 않는 파일 형식: {}", other))),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Bin => "bin",
            FileType::Hex => "hex",
            FileType::Ds8 => "ds8",
        };
        f.write_str(name)
    }
}

/// ds8 파일 헤더 (제목 16바이트 + 블록 크기 u32 LE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ds8Header {
    pub block_size: u32,
}

impl Ds8Header {
    pub const SIZE: usize = 20;
    pub const TITLE: &'static [u8] = b"DS8 binary file";
    const TITLE_LEN: usize = 16;

    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..Self::TITLE.len()].copy_from_slice(Self::TITLE);
        buf[Self::TITLE_LEN..].copy_from_slice(&self.block_size.to_le_bytes());
        buf
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.encode())?;
        Ok(())
    }

    /// 헤더 파싱 (제목은 첫 NUL까지 비교)
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Protocol("Wrong size of file.".into()));
        }
        let title = &buf[..Self::TITLE_LEN];
        let end = title.iter().position(|&b| b == 0).unwrap_or(Self::TITLE_LEN);
        if &title[..end] != Self::TITLE {
            return Err(Error::Protocol("Wrong type of file.".into()));
        }

        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[Self::TITLE_LEN..Self::SIZE]);
        let block_size = u32::from_le_bytes(size);
        let bs = block_size as usize;
        if bs < BLOCK_HEADER_SIZE || bs % WORD_SIZE != 0 {
            return Err(Error::Protocol(format!(
                "Wrong block size in ds8 header: {}",
                block_size
            )));
        }
        Ok(Self { block_size })
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        input
            .read_exact(&mut buf)
            .map_err(|_| Error::Protocol("Wrong size of file.".into()))?;
        Self::parse(&buf)
    }
}

/// 읽기 전용 ds8 파일
pub struct Ds8File {
    pub header: Ds8Header,
    /// 헤더 뒤 블록 수
    pub blocks: u64,
    reader: BufReader<File>,
}

impl Ds8File {
    /// 헤더와 크기 검증 후 열기
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("File \"{}\" not found: {}", path.display(), e)))?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = Ds8Header::read_from(&mut reader)?;

        let body = len.saturating_sub(Ds8Header::SIZE as u64);
        if body % header.block_size as u64 != 0 {
            return Err(Error::Protocol("Wrong size of file.".into()));
        }
        Ok(Self {
            blocks: body / header.block_size as u64,
            header,
            reader,
        })
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    /// 다음 블록 (없으면 false)
    pub fn next_block(&mut self, buf: &mut [u8]) -> Result<bool> {
        let bs = self.block_size();
        if buf.len() < bs {
            return Err(Error::BufferTooSmall {
                needed: bs,
                got: buf.len(),
            });
        }
        match self.reader.read_exact(&mut buf[..bs]) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// 버퍼를 채울 때까지 읽기 (EOF면 덜 채워짐)
pub(crate) fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// hex 텍스트의 워드들 (줄마다 첫 토큰, 태그는 무시)
pub fn parse_hex_words<R: BufRead>(input: R) -> Result<Vec<u64>> {
    let mut words = Vec::new();
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let word = u64::from_str_radix(token, 16).map_err(|_| {
            Error::Protocol(format!("잘못된 hex 워드 (line {}): {}", number + 1, token))
        })?;
        words.push(word);
    }
    Ok(words)
}

/// 워드 한 줄 기록
pub fn write_hex_word<W: Write>(out: &mut W, word: u64, tag: bool) -> Result<()> {
    if tag {
        writeln!(out, "{:016x}{}", word, HEX_TAG)?;
    } else {
        writeln!(out, "{:016x}", word)?;
    }
    Ok(())
}

/// 바이트를 LE 워드로 (마지막 워드는 0으로 채움)
pub fn bytes_to_words(data: &[u8]) -> impl Iterator<Item = u64> + '_ {
    data.chunks(WORD_SIZE).map(|piece| {
        let mut word = [0u8; WORD_SIZE];
        word[..piece.len()].copy_from_slice(piece);
        u64::from_le_bytes(word)
    })
}

/// 워드들을 데이터 블록들로 (빈 입력이면 블록 없음)
pub fn words_to_blocks(words: &[u64], block_size: usize) -> Result<Vec<Vec<u8>>> {
    let per_block = payload_capacity(block_size) / WORD_SIZE;
    if per_block == 0 {
        return Err(Error::Config(format!("블록 크기가 너무 작음: {}", block_size)));
    }
    words
        .chunks(per_block)
        .map(|piece| {
            let mut payload = Vec::with_capacity(piece.len() * WORD_SIZE);
            for word in piece {
                payload.put_u64_le(*word);
            }
            encode_data_block(&payload, block_size).map(|b| b.to_vec())
        })
        .collect()
}

/// bin → ds8
///
/// 마지막 블록의 데이터 뒤 워드는 공백(0x20)으로 채우고 종료 블록을 붙인다
pub fn bin_to_ds8<R: Read, W: Write>(input: &mut R, out: &mut W, block_size: usize) -> Result<u64> {
    Ds8Header::new(block_size as u32).write_to(out)?;
    let capacity = payload_capacity(block_size);
    let mut payload = vec![0u8; capacity];
    let mut words = 0u64;

    loop {
        let n = read_full(input, &mut payload)?;
        if n == 0 {
            break;
        }
        let mut block = encode_data_block(&payload[..n], block_size)?.to_vec();
        if n < capacity {
            let first_fill = BLOCK_HEADER_SIZE + n.div_ceil(WORD_SIZE) * WORD_SIZE;
            for word in block[first_fill..].chunks_mut(WORD_SIZE) {
                word.copy_from_slice(&SPACE_FILL.to_le_bytes());
            }
        }
        out.write_all(&block)?;
        words += (capacity / WORD_SIZE) as u64;
        if n < capacity {
            break;
        }
    }

    out.write_all(&encode_terminate_block(block_size)?)?;
    out.flush()?;
    Ok(words)
}

/// hex → ds8
pub fn hex_to_ds8<R: BufRead, W: Write>(input: R, out: &mut W, block_size: usize) -> Result<u64> {
    let words = parse_hex_words(input)?;
    Ds8Header::new(block_size as u32).write_to(out)?;
    for block in words_to_blocks(&words, block_size)? {
        out.write_all(&block)?;
    }
    out.write_all(&encode_terminate_block(block_size)?)?;
    out.flush()?;
    Ok(words.len() as u64)
}

/// hex → bin
pub fn hex_to_bin<R: BufRead, W: Write>(input: R, out: &mut W) -> Result<u64> {
    let words = parse_hex_words(input)?;
    for word in &words {
        out.write_all(&word.to_le_bytes())?;
    }
    out.flush()?;
    Ok(words.len() as u64)
}

/// bin → hex
pub fn bin_to_hex<R: Read, W: Write>(input: &mut R, out: &mut W, tag: bool) -> Result<u64> {
    const READ_CHUNK: usize = 128 * 128;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut words = 0u64;
    loop {
        let n = read_full(input, &mut buf)?;
        if n == 0 {
            break;
        }
        for word in bytes_to_words(&buf[..n]) {
            write_hex_word(out, word, tag)?;
            words += 1;
        }
        if n < READ_CHUNK {
            break;
        }
    }
    out.flush()?;
    Ok(words)
}

/// ds8 블록들을 종료 블록 전까지 순회
fn for_each_ds8_payload<F>(file: &mut Ds8File, mut f: F) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut block = vec![0u8; file.block_size()];
    let mut blocks = 0u64;
    while file.next_block(&mut block)? {
        let frame = BlockFrame::parse(&block)?;
        if frame.is_terminal() {
            break;
        }
        if frame.is_data() {
            f(frame.payload()?)?;
            blocks += 1;
        }
    }
    Ok(blocks)
}

/// ds8 → bin
pub fn ds8_to_bin<W: Write>(file: &mut Ds8File, out: &mut W) -> Result<u64> {
    let blocks = for_each_ds8_payload(file, |payload| Ok(out.write_all(payload)?))?;
    out.flush()?;
    Ok(blocks)
}

/// ds8 → hex
pub fn ds8_to_hex<W: Write>(file: &mut Ds8File, out: &mut W, tag: bool) -> Result<u64> {
    let blocks = for_each_ds8_payload(file, |payload| {
        for word in bytes_to_words(payload) {
            write_hex_word(out, word, tag)?;
        }
        Ok(())
    })?;
    out.flush()?;
    Ok(blocks)
}

fn open_input(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Config(format!("File \"{}\" not found: {}", path.display(), e)))
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| Error::Config(format!("File \"{}\" cannot be created: {}", path.display(), e)))
}

/// 파일 변환
///
/// 입력과 출력 형식이 같으면 설정 에러. ds8 출력 블록 크기는 정규화된다
pub fn convert_file(
    input: impl AsRef<Path>,
    itype: FileType,
    output: impl AsRef<Path>,
    otype: FileType,
    block_size: usize,
    tag: bool,
) -> Result<u64> {
    if itype == otype {
        return Err(Error::Config(format!(
            "입력과 출력 파일 형식이 같음: {}",
            itype
        )));
    }

    let (input, output) = (input.as_ref(), output.as_ref());
    info!(
        "File {} converting to {}...",
        input.display(),
        output.display()
    );

    let converted = match (itype, otype) {
        (FileType::Bin, FileType::Ds8) => {
            let block_size = normalize_block_size(block_size);
            info!("Use size of block: {}", block_size);
            bin_to_ds8(&mut open_input(input)?, &mut create_output(output)?, block_size)?
        }
        (FileType::Hex, FileType::Ds8) => {
            let block_size = normalize_block_size(block_size);
            info!("Use size of block: {}", block_size);
            hex_to_ds8(open_input(input)?, &mut create_output(output)?, block_size)?
        }
        (FileType::Hex, FileType::Bin) => hex_to_bin(open_input(input)?, &mut create_output(output)?)?,
        (FileType::Bin, FileType::Hex) => {
            bin_to_hex(&mut open_input(input)?, &mut create_output(output)?, tag)?
        }
        (FileType::Ds8, FileType::Bin) => {
            ds8_to_bin(&mut Ds8File::open(input)?, &mut create_output(output)?)?
        }
        (FileType::Ds8, FileType::Hex) => {
            ds8_to_hex(&mut Ds8File::open(input)?, &mut create_output(output)?, tag)?
        }
        (same, _) => {
            return Err(Error::Config(format!("입력과 출력 파일 형식이 같음: {}", same)));
        }
    };

    info!("All words is convert: {}", converted);
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::word_at;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_file_type_parse() {
        assert_eq!("BIN".parse::<FileType>().unwrap(), FileType::Bin);
        assert_eq!("ds8".parse::<FileType>().unwrap(), FileType::Ds8);
        assert!(matches!("txt".parse::<FileType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_ds8_header_layout() {
        let bytes = Ds8Header::new(4096).encode();
        assert_eq!(&bytes[..15], b"DS8 binary file");
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[16..], &4096u32.to_le_bytes());
        assert_eq!(Ds8Header::parse(&bytes).unwrap().block_size, 4096);

        let mut wrong = bytes;
        wrong[0] = b'X';
        assert!(Ds8Header::parse(&wrong).is_err());
    }

    #[test]
    fn test_bin_to_ds8_layout() {
        let data = sample(300);
        let mut out = Vec::new();
        bin_to_ds8(&mut data.as_slice(), &mut out, 128).unwrap();

        assert_eq!(out.len(), Ds8Header::SIZE + 4 * 128);
        let blocks: Vec<&[u8]> = out[Ds8Header::SIZE..].chunks(128).collect();
        assert_eq!(word_at(blocks[0], 0), 112);
        assert_eq!(word_at(blocks[2], 0), 76);
        // 76 bytes → 10 워드 사용, 나머지 4 워드는 공백
        assert_eq!(word_at(blocks[2], 12), SPACE_FILL);
        assert_eq!(word_at(blocks[2], 15), SPACE_FILL);
        assert!(BlockFrame::parse(blocks[3]).unwrap().is_terminal());
    }

    #[test]
    fn test_bin_ds8_bin_files() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("data.bin");
        let ds8 = dir.path().join("data.ds8");
        let back = dir.path().join("back.bin");
        let data = sample(1000);
        std::fs::write(&bin, &data).unwrap();

        convert_file(&bin, FileType::Bin, &ds8, FileType::Ds8, 100, false).unwrap();
        let header = Ds8Header::parse(&std::fs::read(&ds8).unwrap()).unwrap();
        assert_eq!(header.block_size, 128);

        convert_file(&ds8, FileType::Ds8, &back, FileType::Bin, 0, false).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_bin_to_hex_with_tag() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        data.push(0xff);

        let mut out = Vec::new();
        bin_to_hex(&mut data.as_slice(), &mut out, true).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0102030405060708 02\n00000000000000ff 02\n"
        );
    }

    #[test]
    fn test_hex_to_bin_ignores_tags() {
        let text = "0102030405060708 02\n\n00000000000000ff\n";
        let mut out = Vec::new();
        assert_eq!(hex_to_bin(text.as_bytes(), &mut out).unwrap(), 2);
        assert_eq!(&out[..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(out[8], 0xff);

        assert!(hex_to_bin("zz\n".as_bytes(), &mut Vec::new()).is_err());
    }

    #[test]
    fn test_hex_ds8_hex_files() {
        let dir = tempfile::tempdir().unwrap();
        let hex = dir.path().join("data.hex");
        let ds8 = dir.path().join("data.ds8");
        let back = dir.path().join("back.hex");
        let text: String = (0..20u64).map(|w| format!("{:016x}\n", w * 0x1111)).collect();
        std::fs::write(&hex, &text).unwrap();

        assert_eq!(
            convert_file(&hex, FileType::Hex, &ds8, FileType::Ds8, 128, false).unwrap(),
            20
        );
        // 블록당 14 워드 → 데이터 블록 2개 + 종료 블록
        let file = Ds8File::open(&ds8).unwrap();
        assert_eq!(file.blocks, 3);

        convert_file(&ds8, FileType::Ds8, &back, FileType::Hex, 0, false).unwrap();
        assert_eq!(std::fs::read_to_string(&back).unwrap(), text);
    }

    #[test]
    fn test_same_types_rejected() {
        let err = convert_file("a", FileType::Hex, "b", FileType::Hex, 128, false).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_ds8_wrong_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ds8");
        let mut bytes = Ds8Header::new(128).encode().to_vec();
        bytes.extend_from_slice(&[0u8; 100]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(Ds8File::open(&path), Err(Error::Protocol(_))));
    }
}
