use std::{path::Path, sync::Arc, time::Duration};

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest_cookie_store::CookieStoreMutex;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::stats::DownloadStatistics;

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0";
pub const ORIGIN: &str = "https://www.mujrozhlas.cz";
pub const HOME_URL: &str = "https://www.mujrozhlas.cz/";
pub const ACCEPT_LANGUAGE: &str = "cs,en-US;q=0.7,en;q=0.3";

/// A download that sends nothing for this long is abandoned.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpClient {
    pub client: reqwest::Client,
    pub cookies: Arc<CookieStoreMutex>,
    pub chunk_timeout: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] header::InvalidHeaderValue),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("server sent an empty body")]
    Empty,
    #[error("no data received for {0:?}")]
    Stalled(Duration),
}

/// Headers the site's own player sends to the CDN.
pub fn browser_headers(referer: &str) -> Result<HeaderMap, header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(ACCEPT_LANGUAGE),
    );
    headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
    headers.insert(header::REFERER, HeaderValue::from_str(referer)?);
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(headers)
}

/// The same headers in the `-headers` format ffmpeg expects, CRLF terminated.
pub fn ffmpeg_headers(referer: &str) -> String {
    format!(
        "Origin: {}\r\nReferer: {}\r\nAccept: */*\r\nAccept-Language: {}\r\nPragma: no-cache\r\nCache-Control: no-cache\r\n",
        ORIGIN, referer, ACCEPT_LANGUAGE
    )
}

impl HttpClient {
    pub fn new(referer: &str) -> Result<HttpClient, DownloadError> {
        let cookies = Arc::new(CookieStoreMutex::default());

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(browser_headers(referer)?)
            .cookie_provider(cookies.clone())
            .connect_timeout(Duration::from_secs(60))
            .build()?;

        Ok(HttpClient {
            client,
            cookies,
            chunk_timeout: CHUNK_TIMEOUT,
        })
    }

    /// Streams `url` into `path`, going through a `.tmp` sibling so a partial
    /// download never sits under the final name. Fails on HTTP error statuses,
    /// empty bodies and when no data arrives for `chunk_timeout`; the `.tmp`
    /// file is removed on every failure.
    pub async fn download_file(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let temp_path = path.with_extension("tmp");

        let result = self.stream_to(url, &temp_path).await;
        let result = match result {
            Ok(size) => tokio::fs::rename(&temp_path, path)
                .await
                .map(|_| size)
                .map_err(DownloadError::from),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn stream_to(&self, url: &str, temp_path: &Path) -> Result<u64, DownloadError> {
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut stats = DownloadStatistics::new(resp.content_length());
        let mut file = File::create(temp_path).await?;

        loop {
            let chunk = tokio::time::timeout(self.chunk_timeout, resp.chunk())
                .await
                .map_err(|_| DownloadError::Stalled(self.chunk_timeout))??;
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            stats.add(chunk.len() as u64);
            stats.print_throttled();
        }

        file.flush().await?;
        stats.finish();

        if stats.bytes_downloaded == 0 {
            return Err(DownloadError::Empty);
        }

        Ok(stats.bytes_downloaded)
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
            .map_err(|e| e.into())
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "KiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "MiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "GiB";
    }
    if bytes > 1024.0 {
        bytes /= 1024.0;
        suffix = "TiB";
    }

    format!("{:.2} {}", bytes, suffix)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
