use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use croaod_dl::{job::Job, pipeline};
use log::error;

#[derive(Debug, Parser)]
#[command(
    name = "croaod-dl",
    version,
    about = "Sniff mujrozhlas.cz streams in headless Chromium, download or record them and merge into one MP3"
)]
struct Cli {
    /// Episode or series page, or a croaod.cz manifest/MP3/segment URL.
    url: String,

    /// Final merged MP3 (default: derived from the URL).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep per-part MP3 files.
    #[arg(long)]
    keep_parts: bool,

    /// Directory to create the parts directory in (default: system temp).
    #[arg(long)]
    parts_dir: Option<PathBuf>,

    /// Path to ffmpeg (default: next to this program, the working directory, or PATH).
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Path to a Chromium or Chrome executable.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Show the browser window while probing.
    #[arg(long)]
    headful: bool,

    /// Seconds to watch network requests after each interaction.
    #[arg(long, default_value_t = 6)]
    dwell: u64,

    /// Seconds the page may take to load.
    #[arg(long, default_value_t = 30)]
    page_timeout: u64,

    /// Give up on a recording after this many seconds.
    #[arg(long)]
    record_timeout: Option<u64>,

    /// Skip visiting the home page before the episode page.
    #[arg(long)]
    no_warmup: bool,
}

impl Cli {
    fn into_job(self) -> Job {
        let mut job = Job::new(self.url, self.output, self.keep_parts);
        job.ffmpeg = self.ffmpeg;
        job.parts_dir = self.parts_dir;
        job.record_timeout = self.record_timeout.map(Duration::from_secs);
        job.probe.chrome = self.chrome;
        job.probe.headless = !self.headful;
        job.probe.observe_window = Duration::from_secs(self.dwell);
        job.probe.page_load_timeout = Duration::from_secs(self.page_timeout);
        if self.no_warmup {
            job.probe.warmup_url = None;
        }
        job
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let job = Cli::parse().into_job();

    match pipeline::run(&job).await {
        Ok(summary) => {
            println!("\nDone.\nOutput: {}", summary.output.display());
            if summary.failures > 0 {
                println!(
                    "{} of {} stream(s) failed, see above.",
                    summary.failures,
                    summary.parts + summary.failures
                );
            }
            if let Some(dir) = summary.kept_parts {
                println!("Parts: {}", dir.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
