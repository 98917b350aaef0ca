//! 표준 입출력 데이터 파일
//!
//! 파일 이름이 `STDIN` / `STDOUT`(대소문자 무시)이면 임시 파일을 거쳐
//! 표준 입력을 읽고 결과를 표준 출력으로 내보낸다.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::Result;

pub const STDIN_NAME: &str = "STDIN";
pub const STDOUT_NAME: &str = "STDOUT";

fn is_named(path: &Path, name: &str) -> bool {
    path.to_str().is_some_and(|s| s.eq_ignore_ascii_case(name))
}

pub fn is_stdin(path: &Path) -> bool {
    is_named(path, STDIN_NAME)
}

pub fn is_stdout(path: &Path) -> bool {
    is_named(path, STDOUT_NAME)
}

/// 입력/출력 경로 (필요하면 임시 파일로 대체)
///
/// 임시 파일은 drop 될 때 삭제된다
#[derive(Debug)]
pub struct StdioFiles {
    input: PathBuf,
    output: PathBuf,
    spooled_in: Option<NamedTempFile>,
    spooled_out: Option<NamedTempFile>,
}

impl StdioFiles {
    /// 프로세스 표준 입력 사용
    pub fn open(input: &Path, output: &Path) -> Result<Self> {
        Self::open_with(input, output, io::stdin().lock())
    }

    /// `input`이 STDIN이면 `stdin` 전체를 임시 파일에 기록
    pub fn open_with<R: Read>(input: &Path, output: &Path, mut stdin: R) -> Result<Self> {
        let spooled_in = if is_stdin(input) {
            let mut tmp = NamedTempFile::new()?;
            let copied = io::copy(&mut stdin, tmp.as_file_mut())?;
            tmp.as_file_mut().flush()?;
            debug!("stdin spooled: {} bytes -> {}", copied, tmp.path().display());
            Some(tmp)
        } else {
            None
        };
        let spooled_out = if is_stdout(output) {
            Some(NamedTempFile::new()?)
        } else {
            None
        };

        Ok(Self {
            input: spooled_in
                .as_ref()
                .map_or_else(|| input.to_path_buf(), |t| t.path().to_path_buf()),
            output: spooled_out
                .as_ref()
                .map_or_else(|| output.to_path_buf(), |t| t.path().to_path_buf()),
            spooled_in,
            spooled_out,
        })
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// 출력을 표준 출력으로 전달
    pub fn finish(self) -> Result<()> {
        self.finish_into(&mut io::stdout().lock())
    }

    /// 출력이 STDOUT이었으면 임시 파일 내용을 `out`에 복사
    pub fn finish_into<W: Write>(self, out: &mut W) -> Result<()> {
        if let Some(tmp) = &self.spooled_out {
            let mut file = File::open(tmp.path())?;
            io::copy(&mut file, out)?;
            out.flush()?;
        }
        Ok(())
    }
}
