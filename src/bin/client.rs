//! tcp_io 클라이언트
//!
//! 사용법:
//!   cargo run --release --bin tcpio-client -- send --host 127.0.0.1 --port 9999 --file data.bin
//!
//! 예시:
//!   # ds8 파일을 4개 소켓으로 전송 (송신 2 + 수신 2)
//!   tcpio-client send -H 10.0.0.5 -p 9999 -f data.ds8 -t ds8 -n 4
//!
//!   # terminate + exit만 전송
//!   tcpio-client send -H 10.0.0.5 -p 9999 --term --exit
//!
//!   # bin -> hex 변환
//!   tcpio-client convert --ifile data.bin --itype bin --ofile data.hex --otype hex --tag

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tcpio::app::{send_file, send_terminate_only};
use tcpio::app::default_output;
use tcpio::convert::{convert_file, FileType};
use tcpio::stdio::{is_stdin, is_stdout, StdioFiles};
use tcpio::{Error, ErrorKind, Session, SessionConfig, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, WAIT_STEP_SECS};

/// 연결/전송 등 실행 중 실패 종료 코드
const EXIT_FAILURE: u8 = 1;
/// 검증 에러 종료 코드
const EXIT_VALIDATION: u8 = 3;
/// 인자 파싱 에러 종료 코드
const EXIT_USAGE: u8 = 2;

/// tcp_io protocol client
#[derive(Parser, Debug)]
#[command(name = "tcpio-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a data file (or terminate only) to a tcp_io server
    Send(SendArgs),

    /// Convert a data file between bin, hex and ds8 formats
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Server host name or IP address
    #[arg(short = 'H', long)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data file to send
    #[arg(short, long, required_unless_present = "term", conflicts_with = "term")]
    file: Option<PathBuf>,

    /// Data file type (bin, hex, ds8)
    #[arg(short = 't', long = "type", default_value = "bin")]
    file_type: FileType,

    /// Output file for the server response (default: <file>.out)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Send the terminate command only
    #[arg(long)]
    term: bool,

    /// Send the exit command together with terminate
    #[arg(long)]
    exit: bool,

    /// Number of sockets (even unless duplex)
    #[arg(short, long, default_value_t = 1)]
    n_sockets: usize,

    /// Use each socket for both directions
    #[arg(short, long)]
    duplex: bool,

    /// Requested block size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Delay after each sent block (ms)
    #[arg(long, default_value_t = 0)]
    delay_send: u64,

    /// Delay after each received block (ms)
    #[arg(long, default_value_t = 0)]
    delay_receive: u64,

    /// Send/receive timeout (s, 0 = none)
    #[arg(long, default_value_t = 0)]
    time_out: u64,

    /// Connect and handshake wait budget (s)
    #[arg(long, default_value_t = 0)]
    wait_connect: u64,

    /// Delay between socket connects (ms)
    #[arg(long, default_value_t = 0)]
    delay_after_connect: u64,

    /// Print a hex dump of every block
    #[arg(long)]
    print: bool,

    /// Validate every socket handshake against socket 0
    #[arg(long)]
    strict: bool,
}

impl SendArgs {
    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.host.clone(), self.port)
            .with_block_size(self.block_size)
            .with_sockets(self.n_sockets, self.duplex)
            .with_delays(
                Duration::from_millis(self.delay_send),
                Duration::from_millis(self.delay_receive),
            )
            .with_io_timeout(Duration::from_secs(self.time_out))
            .with_wait_connect(
                Duration::from_secs(self.wait_connect),
                Duration::from_secs(WAIT_STEP_SECS),
            )
            .with_delay_after_connect(Duration::from_millis(self.delay_after_connect))
            .with_display_raw(self.print)
            .with_exit_on_terminate(self.exit)
            .with_strict_handshake(self.strict)
    }
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input file
    #[arg(long)]
    ifile: PathBuf,

    /// Input file type (bin, hex, ds8)
    #[arg(long)]
    itype: FileType,

    /// Output file
    #[arg(long)]
    ofile: PathBuf,

    /// Output file type (bin, hex, ds8)
    #[arg(long)]
    otype: FileType,

    /// Append the " 02" data tag to each hex word
    #[arg(long)]
    tag: bool,

    /// Block size for ds8 output
    #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
}

async fn run_send(args: SendArgs) -> tcpio::Result<()> {
    let config = args.session_config();

    if args.term {
        if args.exit {
            let mut session = Session::new(config)?;
            let received = session.send_exit().await?;
            info!("Response block received: {} bytes", received);
        } else {
            let sent = send_terminate_only(config).await?;
            info!("Terminate sent: {} bytes", sent);
        }
        return Ok(());
    }

    let file = args
        .file
        .ok_or_else(|| Error::Config("전송할 파일이 지정되지 않음".into()))?;
    let output = args.output.unwrap_or_else(|| default_output(&file));
    let files = StdioFiles::open(&file, &output)?;
    send_file(
        config,
        files.input(),
        args.file_type,
        Some(files.output().to_path_buf()),
    )
    .await?;
    files.finish()
}

fn run_convert(args: ConvertArgs) -> tcpio::Result<()> {
    let files = StdioFiles::open(&args.ifile, &args.ofile)?;
    convert_file(
        files.input(),
        args.itype,
        files.output(),
        args.otype,
        args.block_size,
        args.tag,
    )?;
    files.finish()
}

/// 데이터가 표준 출력으로 나가면 로그는 stderr로
fn writes_stdout(command: &Commands) -> bool {
    match command {
        Commands::Send(args) => {
            args.output.as_deref().map_or_else(
                || args.file.as_deref().is_some_and(is_stdin),
                is_stdout,
            )
        }
        Commands::Convert(args) => is_stdout(&args.ofile),
    }
}

/// 설정 검증 에러만 3, 나머지 실행 실패는 1
fn exit_code(err: &Error) -> u8 {
    match err.kind() {
        ErrorKind::Config => EXIT_VALIDATION,
        _ => EXIT_FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    // 로깅 설정
    let default_level = if cli.verbose { "tcpio=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder().with_env_filter(filter);
    let installed = if writes_stdout(&cli.command) {
        tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = installed {
        eprintln!("logger init failed: {}", e);
    }

    let result = match cli.command {
        Commands::Send(args) => run_send(args).await,
        Commands::Convert(args) => run_convert(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ERROR: {}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
