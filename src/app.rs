//! 파일 전송 애플리케이션
//!
//! 파일을 블록으로 보내면서 동시에 서버 응답을 `<파일>.out`에 기록한다.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::convert::{parse_hex_words, read_full, words_to_blocks, Ds8File, FileType};
use crate::frame::{encode_data_block, is_terminal};
use crate::sink::{BinSink, Ds8Sink, HexSink, ReceiveReport};
use crate::stats::{format_bytes, spawn_status_reporter, TransferStats};
use crate::stdio::{is_stdin, STDOUT_NAME};
use crate::{BlockTransport, Error, Result, Session, SessionConfig, SocketPool};

/// 상태 출력 주기
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// 기본 출력 경로 (`<입력>.out`, 입력이 STDIN이면 STDOUT)
pub fn default_output(path: &Path) -> PathBuf {
    if is_stdin(path) {
        return PathBuf::from(STDOUT_NAME);
    }
    let mut name = path.as_os_str().to_owned();
    name.push(".out");
    PathBuf::from(name)
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| Error::Config(format!("File \"{}\" not found: {}", path.display(), e)))
}

/// 수신 태스크 시작 (형식에 맞는 싱크로 기록)
fn spawn_receiver(
    transport: BlockTransport,
    output: PathBuf,
    file_type: FileType,
) -> JoinHandle<Result<ReceiveReport>> {
    tokio::spawn(async move {
        let file = File::create(&output).map_err(|e| {
            Error::Config(format!("File \"{}\" not created: {}", output.display(), e))
        })?;
        let writer = BufWriter::new(file);
        let started = Instant::now();

        let report = match file_type {
            FileType::Bin => transport.receive_into(&mut BinSink::new(writer)).await?,
            FileType::Hex => transport.receive_into(&mut HexSink::new(writer)).await?,
            FileType::Ds8 => {
                let mut sink = Ds8Sink::new(writer, transport.block_size())?;
                transport.receive_into(&mut sink).await?
            }
        };

        info!(
            "Receiving: {} blocks, {} in {:.2}s -> {}",
            report.blocks,
            format_bytes(report.payload_bytes as f64),
            started.elapsed().as_secs_f64(),
            output.display()
        );
        Ok(report)
    })
}

/// 진행 중인 전송의 수신 태스크와 상태 출력 태스크
struct Transfer {
    pool: Arc<SocketPool>,
    receiver: JoinHandle<Result<ReceiveReport>>,
    reporter: JoinHandle<()>,
}

impl Transfer {
    fn start(session: &Session, transport: &BlockTransport, output: PathBuf, file_type: FileType) -> Self {
        Self {
            pool: transport.pool().clone(),
            receiver: spawn_receiver(transport.clone(), output, file_type),
            reporter: spawn_status_reporter(session.stats(), STATUS_INTERVAL),
        }
    }
}

/// 송신이 끝난 뒤 수신 태스크와 결과 합치기
///
/// 송신이 실패하면 풀을 중단해서 terminate를 기다리는 수신 태스크를 깨운다
async fn finish(session: &Session, sent: Result<()>, transfer: Transfer) -> Result<TransferStats> {
    let Transfer {
        pool,
        receiver,
        reporter,
    } = transfer;
    if let Err(e) = &sent {
        pool.abort(format!("send failed: {}", e));
    }
    let received = receiver
        .await
        .map_err(|e| Error::Protocol(format!("수신 태스크 실패: {}", e)));
    reporter.abort();

    sent?;
    let report = received??;
    if !report.terminated {
        warn!("Receiver stopped without terminate block");
    }

    let stats = session.stats().snapshot();
    info!("{}", stats.summary());
    Ok(stats)
}

/// 바이너리 파일 전송
pub async fn send_bin_file(
    config: SessionConfig,
    path: impl AsRef<Path>,
    output: Option<PathBuf>,
) -> Result<TransferStats> {
    let path = path.as_ref();
    info!("send_bin_file({}) started.", path.display());
    let mut input = BufReader::new(open_input(path)?);

    let mut session = Session::new(config)?;
    session.connect().await?;
    let transport = session.transport()?;
    let transfer = Transfer::start(
        &session,
        &transport,
        output.unwrap_or_else(|| default_output(path)),
        FileType::Bin,
    );

    let sent = async {
        let mut payload = vec![0u8; transport.payload_capacity()];
        loop {
            let n = read_full(&mut input, &mut payload)?;
            if n == 0 {
                break;
            }
            transport
                .send(&encode_data_block(&payload[..n], transport.block_size())?)
                .await?;
            if n < payload.len() {
                break;
            }
        }
        transport.send_terminate().await?;
        info!("Sending: {}", format_bytes(transport.stats().bytes_sent() as f64));
        Ok::<(), Error>(())
    }
    .await;

    finish(&session, sent, transfer).await
}

/// hex 텍스트 파일 전송 (워드 단위)
pub async fn send_hex_file(
    config: SessionConfig,
    path: impl AsRef<Path>,
    output: Option<PathBuf>,
) -> Result<TransferStats> {
    let path = path.as_ref();
    info!("send_hex_file({}) started.", path.display());
    let words = parse_hex_words(BufReader::new(open_input(path)?))?;

    let mut session = Session::new(config)?;
    session.connect().await?;
    let transport = session.transport()?;
    let transfer = Transfer::start(
        &session,
        &transport,
        output.unwrap_or_else(|| default_output(path)),
        FileType::Hex,
    );

    let sent = async {
        for block in words_to_blocks(&words, transport.block_size())? {
            transport.send(&block).await?;
        }
        transport.send_terminate().await?;
        Ok::<(), Error>(())
    }
    .await;

    finish(&session, sent, transfer).await
}

/// ds8 파일 전송
///
/// 블록 크기는 파일 헤더 값을 요청하며, 파일의 종료 블록을 그대로 보낸다
pub async fn send_ds8_file(
    config: SessionConfig,
    path: impl AsRef<Path>,
    output: Option<PathBuf>,
) -> Result<TransferStats> {
    let path = path.as_ref();
    info!("send_ds8_file({}) started.", path.display());
    let mut file = Ds8File::open(path)?;
    let block_size = file.block_size();

    let mut session = Session::new(config.with_block_size(block_size))?;
    session.connect().await?;
    let transport = session.transport()?;
    if transport.block_size() != block_size {
        return Err(Error::Protocol(format!(
            "협상된 블록 크기 {}가 ds8 파일 블록 크기 {}와 다름",
            transport.block_size(),
            block_size
        )));
    }

    let transfer = Transfer::start(
        &session,
        &transport,
        output.unwrap_or_else(|| default_output(path)),
        FileType::Ds8,
    );

    let sent = async {
        let mut block = vec![0u8; block_size];
        let mut terminated = false;
        while file.next_block(&mut block)? {
            transport.send(&block).await?;
            if is_terminal(&block) {
                terminated = true;
                break;
            }
        }
        if !terminated {
            return Err(Error::Protocol(format!(
                "ds8 파일에 종료 블록이 없음: {}",
                path.display()
            )));
        }
        Ok::<(), Error>(())
    }
    .await;

    finish(&session, sent, transfer).await
}

/// 파일 형식별 전송
pub async fn send_file(
    config: SessionConfig,
    path: impl AsRef<Path>,
    file_type: FileType,
    output: Option<PathBuf>,
) -> Result<TransferStats> {
    match file_type {
        FileType::Bin => send_bin_file(config, path, output).await,
        FileType::Hex => send_hex_file(config, path, output).await,
        FileType::Ds8 => send_ds8_file(config, path, output).await,
    }
}

/// terminate만 전송 (`exit_on_terminate`면 exit 포함)
pub async fn send_terminate_only(config: SessionConfig) -> Result<usize> {
    let mut session = Session::new(config)?;
    session.connect().await?;
    let transport = session.transport()?;
    transport.send_terminate().await
}
