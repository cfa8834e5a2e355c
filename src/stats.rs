use std::{
    io::Write,
    time::{Duration, Instant},
};

use crate::util;

const PRINT_INTERVAL: Duration = Duration::from_millis(100);

pub struct DownloadStatistics {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    started: Instant,
    last_print: Option<Instant>,
}

impl DownloadStatistics {
    pub fn new(bytes_total: Option<u64>) -> Self {
        Self {
            bytes_downloaded: 0,
            bytes_total: bytes_total.filter(|&t| t > 0),
            started: Instant::now(),
            last_print: None,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes_downloaded += bytes;
    }

    /// Bytes per second since the download started.
    pub fn speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-6);
        self.bytes_downloaded as f64 / elapsed
    }

    pub fn line(&self) -> String {
        let speed = self.speed();
        match self.bytes_total {
            Some(total) => {
                let pct = self.bytes_downloaded as f64 / total as f64 * 100.0;
                let remaining = total.saturating_sub(self.bytes_downloaded) as f64;
                let eta = remaining / speed.max(1e-6);
                format!(
                    "{:6.2}%  ({}/{})  {}/s  ETA {}s",
                    pct,
                    util::format_bytes(self.bytes_downloaded),
                    util::format_bytes(total),
                    util::format_bytes(speed as u64),
                    eta as u64
                )
            }
            None => format!(
                "{} downloaded  {}/s",
                util::format_bytes(self.bytes_downloaded),
                util::format_bytes(speed as u64)
            ),
        }
    }

    pub fn print_throttled(&mut self) {
        if self
            .last_print
            .map(|t| t.elapsed() < PRINT_INTERVAL)
            .unwrap_or(false)
        {
            return;
        }
        self.last_print = Some(Instant::now());
        print_line(&self.line());
    }

    pub fn finish(&self) {
        print_line(&self.line());
        println!();
    }
}

pub struct RecordingStatistics {
    /// Position ffmpeg has encoded up to.
    pub position: Duration,
    /// Length of the presentation, when the manifest declares it.
    pub total: Option<Duration>,
    started: Instant,
    ticks: usize,
}

impl RecordingStatistics {
    const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

    pub fn new(total: Option<Duration>) -> Self {
        Self {
            position: Duration::ZERO,
            total,
            started: Instant::now(),
            ticks: 0,
        }
    }

    pub fn line(&self) -> String {
        let spinner = Self::SPINNER[self.ticks % Self::SPINNER.len()];
        let elapsed = util::format_duration(self.started.elapsed());
        match self.total {
            Some(total) => format!(
                "Recording {}  {}/{}  Elapsed: {}",
                spinner,
                util::format_duration(self.position),
                util::format_duration(total),
                elapsed
            ),
            None => format!(
                "Recording {}  {}  Elapsed: {}",
                spinner,
                util::format_duration(self.position),
                elapsed
            ),
        }
    }

    pub fn print(&mut self) {
        self.ticks += 1;
        print_line(&self.line());
    }

    pub fn finish(&self) {
        print_line(&self.line());
        println!();
    }
}

fn print_line(line: &str) {
    print!("\x1b[2K\r    {}", line);
    let _ = std::io::stdout().lock().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_line_with_total() {
        let mut stats = DownloadStatistics::new(Some(2048));
        stats.add(1024);
        let line = stats.line();
        assert!(line.starts_with(" 50.00%"), "{}", line);
        assert!(line.contains("(1024.00 B/2.00 KiB)"), "{}", line);
    }

    #[test]
    fn download_line_without_total() {
        let mut stats = DownloadStatistics::new(Some(0));
        assert_eq!(stats.bytes_total, None);
        stats.add(10);
        assert!(stats.line().starts_with("10.00 B downloaded"));
    }

    #[test]
    fn recording_line() {
        let mut stats = RecordingStatistics::new(Some(Duration::from_secs(600)));
        stats.position = Duration::from_secs(61);
        assert!(stats.line().contains("01:01/10:00"), "{}", stats.line());

        stats.total = None;
        assert!(stats.line().contains(" 01:01 "), "{}", stats.line());
    }
}
