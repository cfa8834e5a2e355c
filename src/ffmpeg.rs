use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, Command},
};

use crate::{stats::RecordingStatistics, util};

/// Bitrate of every recorded part.
pub const OUTPUT_BITRATE: &str = "192k";

#[cfg(windows)]
const PROGRAM: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const PROGRAM: &str = "ffmpeg";

/// Keep at most this much of ffmpeg's stderr for error reports.
const DIAGNOSTICS_LIMIT: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum FfmpegError {
    #[error(
        "ffmpeg not found; put the ffmpeg executable next to this program, in the working \
         directory, or on PATH (or pass --ffmpeg)"
    )]
    NotFound,
    #[error("ffmpeg at {path} is not usable: {reason}")]
    Unusable { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("ffmpeg exited with {status}: {diagnostics}")]
    Failed {
        status: ExitStatus,
        diagnostics: String,
    },
    #[error("ffmpeg did not finish within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct Encoder {
    program: PathBuf,
}

impl Encoder {
    /// Looks for ffmpeg next to the running executable, then in the working
    /// directory, then on `PATH`.
    pub fn locate() -> Result<Self, FfmpegError> {
        let mut dirs = Vec::new();
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(dir);
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        find_program(dirs, PROGRAM)
            .map(|program| Self { program })
            .ok_or(FfmpegError::NotFound)
    }

    pub fn at(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs `ffmpeg -version` and returns its first line. Used at startup to
    /// fail before any network work when the binary cannot run.
    pub async fn version(&self) -> Result<String, FfmpegError> {
        let unusable = |reason: String| FfmpegError::Unusable {
            path: self.program.clone(),
            reason,
        };

        let output = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| unusable(e.to_string()))?;

        if !output.status.success() {
            return Err(unusable(format!("-version exited with {}", output.status)));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    /// Records a DASH manifest in real time into an MP3 at [`OUTPUT_BITRATE`].
    pub async fn record(
        &self,
        manifest_url: &str,
        output: &Path,
        referer: &str,
        total: Option<Duration>,
        limit: Option<Duration>,
    ) -> Result<(), FfmpegError> {
        let mut cmd = Command::new(&self.program);

        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-user_agent")
            .arg(util::USER_AGENT)
            .arg("-headers")
            .arg(util::ffmpeg_headers(referer))
            .arg("-i")
            .arg(manifest_url)
            .arg("-vn")
            .arg("-c:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(OUTPUT_BITRATE)
            .arg("-progress")
            .arg("pipe:1")
            .arg("-nostats")
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let diagnostics = collect_stderr(&mut child);
        let mut stats = RecordingStatistics::new(total);

        let status = match limit {
            Some(limit) => {
                let watched =
                    tokio::time::timeout(limit, watch_progress(&mut child, &mut stats)).await;
                match watched {
                    Ok(status) => status?,
                    Err(_) => {
                        stats.finish();
                        let _ = child.kill().await;
                        return Err(FfmpegError::TimedOut(limit));
                    }
                }
            }
            None => watch_progress(&mut child, &mut stats).await?,
        };
        stats.finish();

        if !status.success() {
            return Err(FfmpegError::Failed {
                status,
                diagnostics: diagnostics.await.unwrap_or_default(),
            });
        }

        Ok(())
    }

    /// Joins `parts` in order into `output` with the concat demuxer, copying
    /// the audio stream.
    pub async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        let mut list = tempfile::Builder::new()
            .prefix("concat")
            .suffix(".txt")
            .tempfile()?;
        list.write_all(concat_list(parts).as_bytes())?;
        list.flush()?;

        let mut cmd = Command::new(&self.program);

        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list.path())
            .arg("-c")
            .arg("copy")
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null());

        let out = cmd.output().await?;
        if !out.status.success() {
            return Err(FfmpegError::Failed {
                status: out.status,
                diagnostics: tail(&String::from_utf8_lossy(&out.stderr)),
            });
        }

        Ok(())
    }
}

fn find_program<I>(dirs: I, name: &str) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Reads stderr on its own task so ffmpeg never blocks on a full pipe.
fn collect_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        tail(&String::from_utf8_lossy(&buf))
    })
}

async fn watch_progress(
    child: &mut Child,
    stats: &mut RecordingStatistics,
) -> Result<ExitStatus, FfmpegError> {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(position) = parse_progress(&line) {
                stats.position = position;
                stats.print();
            }
        }
    }

    Ok(child.wait().await?)
}

/// Extracts the encoded position from one `-progress` line.
fn parse_progress(line: &str) -> Option<Duration> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse::<u64>().ok().map(Duration::from_micros),
        _ => None,
    }
}

/// Builds a concat demuxer list. Single quotes inside paths are closed,
/// escaped and reopened as the demuxer's quoting rules require.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| {
            let mut path = p.to_string_lossy().into_owned();
            if cfg!(windows) {
                path = path.replace('\\', "/");
            }
            format!("file '{}'\n", path.replace('\'', r"'\''"))
        })
        .collect()
}

fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= DIAGNOSTICS_LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - DIAGNOSTICS_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
