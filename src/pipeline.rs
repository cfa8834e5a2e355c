use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    dash, ffmpeg,
    job::Job,
    probe,
    source::{self, Candidate, Mode, StreamKind},
    util,
};

/// Parts smaller than this are treated as failed recordings.
pub const MIN_PART_BYTES: u64 = 1024;

/// How many discovered URLs are listed before processing starts.
const LISTED_CANDIDATES: usize = 6;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    InvalidInput(#[from] source::SourceError),
    #[error("{0}")]
    EncoderUnavailable(ffmpeg::FfmpegError),
    #[error(transparent)]
    Derive(#[from] dash::DeriveError),
    #[error("page probing failed: {0}")]
    Probe(#[from] probe::ProbeError),
    #[error("no croaod.cz .mpd/.mp3 streams detected on {url}")]
    NoStreams { url: String },
    #[error("no streams detected on {url}: the page did not load")]
    PageNotLoaded { url: String },
    #[error("no audio retrieved: all {failures} stream(s) failed")]
    NoAudio { failures: usize },
    #[error("merging parts failed: {0}")]
    Merge(ffmpeg::FfmpegError),
    #[error("HTTP client: {0}")]
    Http(#[from] util::DownloadError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidInput(_) => 2,
            Error::EncoderUnavailable(_) => 3,
            Error::NoStreams { .. } | Error::PageNotLoaded { .. } => 4,
            Error::NoAudio { .. } => 5,
            Error::Merge(_) => 6,
            _ => 1,
        }
    }
}

/// Why one candidate did not produce a part.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Download(#[from] util::DownloadError),
    #[error("recording failed: {0}")]
    Record(#[from] ffmpeg::FfmpegError),
    #[error("output missing or too small ({0} bytes)")]
    TooSmall(u64),
}

/// The I/O side of the pipeline: fetching candidates and joining parts.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Downloads a finished audio file into `output`.
    async fn download(&self, url: &str, output: &Path) -> Result<(), FetchError>;

    /// Records a manifest into an MP3 at `output`.
    async fn record(&self, manifest_url: &str, output: &Path) -> Result<(), FetchError>;

    /// Concatenates `parts` in order into `output`.
    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), ffmpeg::FfmpegError>;
}

/// Backend talking to the CDN over HTTP and to ffmpeg.
pub struct LiveBackend {
    http: util::HttpClient,
    encoder: ffmpeg::Encoder,
    referer: String,
    record_timeout: Option<Duration>,
}

impl LiveBackend {
    pub fn new(job: &Job, encoder: ffmpeg::Encoder) -> Result<Self, Error> {
        let referer = job.referer();
        Ok(Self {
            http: util::HttpClient::new(&referer)?,
            encoder,
            referer,
            record_timeout: job.record_timeout,
        })
    }
}

#[async_trait]
impl Backend for LiveBackend {
    async fn download(&self, url: &str, output: &Path) -> Result<(), FetchError> {
        self.http.download_file(url, output).await?;
        Ok(())
    }

    async fn record(&self, manifest_url: &str, output: &Path) -> Result<(), FetchError> {
        let total = match dash::inspect(&self.http, manifest_url).await {
            Ok(manifest) => {
                if let Some(best) = manifest.best() {
                    info!(
                        "Audio: {}kbps ({})",
                        best.bandwidth.unwrap_or(0) / 1000,
                        best.codecs.as_deref().unwrap_or("unknown codec")
                    );
                }
                if manifest.is_dynamic {
                    warn!("Manifest is live; recording runs until the stream ends");
                }
                manifest.duration
            }
            Err(e) => {
                debug!("Could not inspect {}: {}", manifest_url, e);
                None
            }
        };

        self.encoder
            .record(
                manifest_url,
                output,
                &self.referer,
                total,
                self.record_timeout,
            )
            .await?;
        Ok(())
    }

    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), ffmpeg::FfmpegError> {
        self.encoder.concat(parts, output).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// Position in discovery order, starting at 1.
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct Failure {
    pub index: usize,
    pub url: String,
    pub error: FetchError,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub parts: Vec<Part>,
    pub failures: Vec<Failure>,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct Summary {
    pub output: PathBuf,
    pub parts: usize,
    pub failures: usize,
    /// Where the parts were left, when they were kept.
    pub kept_parts: Option<PathBuf>,
}

pub fn part_path(workdir: &Path, index: usize) -> PathBuf {
    workdir.join(format!("{:02} part.mp3", index))
}

/// Fetches every candidate in order. A failing candidate is logged and
/// recorded; it never stops the others.
pub async fn fetch_all<B>(backend: &B, candidates: &[Candidate], workdir: &Path) -> FetchReport
where
    B: Backend + ?Sized,
{
    let mut report = FetchReport::default();

    println!("\nProcessing {} stream(s)", candidates.len());
    for (i, candidate) in candidates.iter().enumerate() {
        let index = i + 1;
        let path = part_path(workdir, index);
        println!(
            "\n[{}/{}] {}",
            index,
            candidates.len(),
            candidate.kind.label()
        );

        match fetch_one(backend, candidate, &path).await {
            Ok(bytes) => {
                info!(
                    "[{}] Saved {} ({})",
                    index,
                    path.file_name().unwrap_or_default().to_string_lossy(),
                    util::format_bytes(bytes)
                );
                report.parts.push(Part { index, path, bytes });
            }
            Err(error) => {
                warn!("[{}] {}: {}; skipping", index, candidate.url, error);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Could not remove {}: {}", path.display(), e);
                    }
                }
                report.failures.push(Failure {
                    index,
                    url: candidate.url.clone(),
                    error,
                });
            }
        }
    }

    report
}

async fn fetch_one<B>(backend: &B, candidate: &Candidate, path: &Path) -> Result<u64, FetchError>
where
    B: Backend + ?Sized,
{
    match candidate.kind {
        StreamKind::Audio => {
            info!("Downloading MP3 {}", candidate.url);
            backend.download(&candidate.url, path).await?;
        }
        StreamKind::Manifest => {
            info!("Recording DASH {} via ffmpeg", candidate.url);
            backend.record(&candidate.url, path).await?;
        }
    }

    let bytes = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if bytes < MIN_PART_BYTES {
        return Err(FetchError::TooSmall(bytes));
    }

    Ok(bytes)
}

/// Produces `output` from the fetched parts. One part is moved into place,
/// several are concatenated. Part files are removed afterwards unless
/// `keep_parts` is set.
pub async fn merge<B>(
    backend: &B,
    report: &FetchReport,
    output: &Path,
    keep_parts: bool,
) -> Result<(), Error>
where
    B: Backend + ?Sized,
{
    match report.parts.as_slice() {
        [] => {
            return Err(Error::NoAudio {
                failures: report.failures.len(),
            })
        }
        [only] => {
            println!("\nSaving the only part as {}", output.display());
            if keep_parts {
                tokio::fs::copy(&only.path, output).await?;
            } else {
                move_file(&only.path, output).await?;
            }
        }
        parts => {
            println!(
                "\nMerging {} part(s) into {}",
                parts.len(),
                output.display()
            );
            let paths: Vec<PathBuf> = parts.iter().map(|p| p.path.clone()).collect();
            let staging = staging_path(output);

            if let Err(e) = backend.concat(&paths, &staging).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(Error::Merge(e));
            }
            if let Err(e) = tokio::fs::rename(&staging, output).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
        }
    }

    if !keep_parts {
        discard(&report.parts).await;
    }

    Ok(())
}

/// Hidden sibling of `output` that concatenation writes to first.
fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{}.merging.mp3", name))
}

/// Renames, falling back to copy and delete when `from` and `to` sit on
/// different file systems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

async fn discard(parts: &[Part]) {
    for part in parts {
        match tokio::fs::remove_file(&part.path).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!("Could not remove {}: {}", part.path.display(), e),
        }
    }
}

/// Resolves the candidates for a job, fetches them and merges the result.
pub async fn run(job: &Job) -> Result<Summary, Error> {
    run_with(job, &probe::ChromiumProber).await
}

/// `run` with page inputs probed through `prober`.
pub async fn run_with<P>(job: &Job, prober: &P) -> Result<Summary, Error>
where
    P: probe::Prober + ?Sized,
{
    let mode = source::classify(&job.source)?;

    let encoder = match &job.ffmpeg {
        Some(path) => ffmpeg::Encoder::at(path),
        None => ffmpeg::Encoder::locate().map_err(Error::EncoderUnavailable)?,
    };
    let version = encoder
        .version()
        .await
        .map_err(Error::EncoderUnavailable)?;
    debug!("Using {} ({})", encoder.program().display(), version);

    let candidates = resolve(job, mode, prober).await?;
    let backend = LiveBackend::new(job, encoder)?;
    process(job, &backend, &candidates).await
}

/// Turns a classified input into the list of streams to fetch. Only page
/// inputs go through `prober`.
pub async fn resolve<P>(job: &Job, mode: Mode, prober: &P) -> Result<Vec<Candidate>, Error>
where
    P: probe::Prober + ?Sized,
{
    let candidates = match mode {
        Mode::Direct(candidate) => vec![candidate],
        Mode::SegmentDerive => {
            let manifest = dash::derive_manifest_url(&job.source)?;
            info!("Derived manifest {}", manifest);
            vec![Candidate {
                url: manifest,
                kind: StreamKind::Manifest,
            }]
        }
        Mode::PageScrape => {
            println!(
                "Opening headless Chromium and sniffing streams: {}",
                job.source
            );
            let report = prober.probe(&job.source, &job.probe).await?;
            if report.candidates.is_empty() {
                let url = job.source.clone();
                return Err(if report.page_loaded {
                    Error::NoStreams { url }
                } else {
                    Error::PageNotLoaded { url }
                });
            }
            report.candidates
        }
    };

    println!("Detected {} stream URL(s).", candidates.len());
    for (i, candidate) in candidates.iter().take(LISTED_CANDIDATES).enumerate() {
        println!("  [{}] {}", i + 1, candidate.url);
    }

    Ok(candidates)
}

/// Fetches `candidates` into a fresh working directory and merges them into
/// the job's output. The directory is kept when asked to, or when a merge
/// failure would otherwise lose the parts.
pub async fn process<B>(
    job: &Job,
    backend: &B,
    candidates: &[Candidate],
) -> Result<Summary, Error>
where
    B: Backend + ?Sized,
{
    let mut builder = tempfile::Builder::new();
    builder.prefix("mujrozhlas_parts_");
    let workdir = match &job.parts_dir {
        Some(dir) => builder.tempdir_in(dir)?,
        None => builder.tempdir()?,
    };

    let report = fetch_all(backend, candidates, workdir.path()).await;
    let merged = merge(backend, &report, &job.output, job.keep_parts).await;

    let kept_parts = if !report.parts.is_empty() && (job.keep_parts || merged.is_err()) {
        let dir = workdir.keep();
        info!("Parts left in {}", dir.display());
        Some(dir)
    } else {
        if let Err(e) = workdir.close() {
            warn!("Could not remove the working directory: {}", e);
        }
        None
    };

    merged?;

    for failure in &report.failures {
        warn!("[{}] {} failed: {}", failure.index, failure.url, failure.error);
    }

    Ok(Summary {
        output: std::fs::canonicalize(&job.output).unwrap_or_else(|_| job.output.clone()),
        parts: report.parts.len(),
        failures: report.failures.len(),
        kept_parts,
    })
}
