//! Sniffs stream URLs out of a mujrozhlas.cz page.
//!
//! The site's player only asks the CDN for a manifest once somebody presses
//! play, so a headless Chromium opens the page, a list of [`Interaction`]s
//! pokes at it, and every request the page sends while that happens is
//! checked against the CDN filter.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::network::{EventRequestWillBeSent, SetUserAgentOverrideParams},
    error::CdpError,
    Element, Page,
};
use futures::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::{
    source::{Candidate, CandidateList},
    util,
};

/// Labels of play buttons on the Czech site.
pub const PLAY_LABELS: &[&str] = &["Přehrát", "Přehrat", "Poslechnout"];

/// Player controls that are worth clicking even without a recognizable label.
pub const PLAY_SELECTORS: &[&str] = &[
    ".b-player__control--play",
    ".player__play",
    ".js-player-play",
    "button.play",
    "[class*='player'] button[class*='play']",
];

/// Elements that may carry a play label.
const CONTROL_SELECTOR: &str = "button, [role='button'], a[class*='play']";

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("invalid browser configuration: {0}")]
    Config(String),
    #[error("could not launch the browser: {0}")]
    Launch(CdpError),
    #[error("browser error: {0}")]
    Browser(#[from] CdpError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// How long navigation may take before the page counts as not loaded.
    pub page_load_timeout: Duration,
    /// How long requests are collected after each interaction.
    pub observe_window: Duration,
    /// Bound for scrolling to and clicking one control.
    pub click_timeout: Duration,
    /// Pause after each successful click.
    pub settle: Duration,
    pub headless: bool,
    pub chrome: Option<PathBuf>,
    /// Visited before the target page so the session looks like a visitor's.
    pub warmup_url: Option<String>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(30),
            observe_window: Duration::from_secs(6),
            click_timeout: Duration::from_secs(2),
            settle: Duration::from_millis(800),
            headless: true,
            chrome: None,
            warmup_url: Some(util::HOME_URL.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ProbeReport {
    pub candidates: Vec<Candidate>,
    /// False when the page did not become interactive in time.
    pub page_loaded: bool,
}

/// One way of making the player start. Implementations should treat every
/// missing or unclickable control as a skip, not an error; an `Err` is
/// reserved for a broken browser connection.
#[async_trait]
pub trait Interaction: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns how many controls were activated.
    async fn perform(&self, page: &Page, opts: &ProbeOptions) -> Result<usize, CdpError>;
}

/// Clicks controls whose text, `aria-label` or `title` contains a play label.
pub struct ClickByLabel {
    pub labels: &'static [&'static str],
}

#[async_trait]
impl Interaction for ClickByLabel {
    fn name(&self) -> &'static str {
        "click by label"
    }

    async fn perform(&self, page: &Page, opts: &ProbeOptions) -> Result<usize, CdpError> {
        let mut clicked = 0;
        for element in page.find_elements(CONTROL_SELECTOR).await? {
            let texts = [
                element.inner_text().await.ok().flatten(),
                element.attribute("aria-label").await.ok().flatten(),
                element.attribute("title").await.ok().flatten(),
            ];
            if label_matches(&texts, self.labels) && activate(&element, opts).await {
                clicked += 1;
            }
        }
        Ok(clicked)
    }
}

/// Clicks everything matching a list of CSS selectors.
pub struct ClickSelectors {
    pub selectors: &'static [&'static str],
}

#[async_trait]
impl Interaction for ClickSelectors {
    fn name(&self) -> &'static str {
        "click player selectors"
    }

    async fn perform(&self, page: &Page, opts: &ProbeOptions) -> Result<usize, CdpError> {
        let mut clicked = 0;
        for selector in self.selectors {
            let elements = match page.find_elements(*selector).await {
                Ok(elements) => elements,
                Err(e) => {
                    debug!("Selector {} not usable: {}", selector, e);
                    continue;
                }
            };
            for element in elements {
                if activate(&element, opts).await {
                    clicked += 1;
                }
            }
        }
        Ok(clicked)
    }
}

/// Scrolls to the bottom until the page stops growing, so lazily rendered
/// players show up.
pub struct ScrollToBottom {
    pub max_rounds: usize,
}

#[async_trait]
impl Interaction for ScrollToBottom {
    fn name(&self) -> &'static str {
        "scroll to bottom"
    }

    async fn perform(&self, page: &Page, _opts: &ProbeOptions) -> Result<usize, CdpError> {
        let mut last = page_height(page).await?;
        let mut rounds = 0;

        while rounds < self.max_rounds {
            page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                .await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            rounds += 1;

            let height = page_height(page).await?;
            if height == last {
                break;
            }
            last = height;
        }

        Ok(rounds)
    }
}

/// Label clicks, then generic selectors, then the same again once lazy
/// players had a chance to render.
pub fn default_strategies() -> Vec<Box<dyn Interaction>> {
    vec![
        Box::new(ClickByLabel {
            labels: PLAY_LABELS,
        }),
        Box::new(ClickSelectors {
            selectors: PLAY_SELECTORS,
        }),
        Box::new(ScrollToBottom { max_rounds: 10 }),
        Box::new(ClickByLabel {
            labels: PLAY_LABELS,
        }),
        Box::new(ClickSelectors {
            selectors: PLAY_SELECTORS,
        }),
    ]
}

/// Opens `url` in a fresh browser and collects CDN stream URLs requested while
/// the strategies run. The browser is shut down whatever the outcome.
pub async fn probe(
    url: &str,
    opts: &ProbeOptions,
    strategies: &[Box<dyn Interaction>],
) -> Result<ProbeReport, ProbeError> {
    let session = Session::launch(opts).await?;
    let result = session.explore(url, opts, strategies).await;
    session.close().await;
    result
}

/// Where page candidates come from.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, opts: &ProbeOptions) -> Result<ProbeReport, ProbeError>;
}

/// Probes with a real Chromium and the default strategies.
pub struct ChromiumProber;

#[async_trait]
impl Prober for ChromiumProber {
    async fn probe(&self, url: &str, opts: &ProbeOptions) -> Result<ProbeReport, ProbeError> {
        probe(url, opts, &default_strategies()).await
    }
}

struct Session {
    browser: Browser,
    handler: JoinHandle<()>,
    profile: TempDir,
}

impl Session {
    /// Starts Chromium on a throwaway profile so nothing leaks between runs.
    async fn launch(opts: &ProbeOptions) -> Result<Self, ProbeError> {
        let profile = tempfile::Builder::new()
            .prefix("croaod-dl-profile")
            .tempdir()?;

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .arg("--lang=cs")
            .arg("--mute-audio")
            .arg("--autoplay-policy=no-user-gesture-required");
        if !opts.headless {
            builder = builder.with_head();
        }
        if let Some(chrome) = &opts.chrome {
            builder = builder.chrome_executable(chrome);
        }
        let config = builder.build().map_err(ProbeError::Config)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(ProbeError::Launch)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("DevTools handler: {}", e);
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            profile,
        })
    }

    async fn explore(
        &self,
        url: &str,
        opts: &ProbeOptions,
        strategies: &[Box<dyn Interaction>],
    ) -> Result<ProbeReport, ProbeError> {
        let page = self.browser.new_page("about:blank").await?;

        let mut user_agent = SetUserAgentOverrideParams::new(util::USER_AGENT);
        user_agent.accept_language = Some(util::ACCEPT_LANGUAGE.to_string());
        page.execute(user_agent).await?;

        if let Some(warmup) = &opts.warmup_url {
            debug!("Warming up on {}", warmup);
            open(&page, warmup, opts.page_load_timeout).await;
            tokio::time::sleep(opts.settle).await;
        }

        let mut found = CandidateList::new();

        let page_loaded = {
            let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
            let loaded = open(&page, url, opts.page_load_timeout).await;
            let urls = requests.by_ref().map(|e| e.request.url.clone());
            observe(urls, opts.observe_window, &mut found).await;
            loaded
        };

        for strategy in strategies {
            let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;

            match strategy.perform(&page, opts).await {
                Ok(n) => debug!("{}: {} control(s) activated", strategy.name(), n),
                Err(e) => warn!("Interaction \"{}\" failed: {}", strategy.name(), e),
            }

            let urls = requests.by_ref().map(|e| e.request.url.clone());
            let new = observe(urls, opts.observe_window, &mut found).await;
            if new > 0 {
                info!("{} new stream(s) after \"{}\"", new, strategy.name());
            }
        }

        Ok(ProbeReport {
            candidates: found.into_vec(),
            page_loaded,
        })
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Could not close the browser cleanly: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Could not reap the browser process: {}", e);
        }
        self.handler.abort();
        let _ = self.handler.await;
        if let Err(e) = self.profile.close() {
            warn!("Could not remove the browser profile: {}", e);
        }
    }
}

/// Navigates and waits for the document to become interactive. Returns
/// whether that happened within `timeout`.
async fn open(page: &Page, url: &str, timeout: Duration) -> bool {
    let load = async {
        page.goto(url).await?;
        loop {
            let state = page.evaluate("document.readyState").await?;
            let ready = matches!(
                state.value().and_then(|v| v.as_str()),
                Some("interactive") | Some("complete")
            );
            if ready {
                return Ok::<_, CdpError>(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    match tokio::time::timeout(timeout, load).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Page {} did not load: {}", url, e);
            false
        }
        Err(_) => {
            warn!("Page {} did not load within {:?}", url, timeout);
            false
        }
    }
}

/// Feeds request URLs into `found` until `window` elapses or the stream ends.
/// Returns how many new candidates were added.
pub async fn observe<S>(mut urls: S, window: Duration, found: &mut CandidateList) -> usize
where
    S: Stream<Item = String> + Unpin,
{
    let deadline = tokio::time::Instant::now() + window;
    let mut added = 0;

    while let Ok(Some(url)) = tokio::time::timeout_at(deadline, urls.next()).await {
        if found.offer(&url) {
            debug!("Stream request: {}", url);
            added += 1;
        }
    }

    added
}

/// Scrolls a control into view and clicks it. Any failure just skips it.
async fn activate(element: &Element, opts: &ProbeOptions) -> bool {
    let attempt = async {
        element.scroll_into_view().await?;
        element.click().await?;
        Ok::<_, CdpError>(())
    };

    match tokio::time::timeout(opts.click_timeout, attempt).await {
        Ok(Ok(())) => {
            tokio::time::sleep(opts.settle).await;
            true
        }
        Ok(Err(e)) => {
            debug!("Click failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Click timed out");
            false
        }
    }
}

async fn page_height(page: &Page) -> Result<f64, CdpError> {
    let height = page.evaluate("document.body.scrollHeight").await?;
    Ok(height.value().and_then(|v| v.as_f64()).unwrap_or(0.0))
}

fn label_matches(texts: &[Option<String>], labels: &[&str]) -> bool {
    texts
        .iter()
        .flatten()
        .any(|text| labels.iter().any(|label| text.contains(label)))
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[test]
    fn labels() {
        let texts = [None, Some("Přehrát epizodu".to_string()), None];
        assert!(label_matches(&texts, PLAY_LABELS));
        assert!(label_matches(
            &[Some("Poslechnout".to_string())],
            PLAY_LABELS
        ));
        assert!(!label_matches(&[Some("Sdílet".to_string()), None], PLAY_LABELS));
        assert!(!label_matches(&[None, None, None], PLAY_LABELS));
    }

    #[test]
    fn strategy_order() {
        let names: Vec<_> = default_strategies().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "click by label",
                "click player selectors",
                "scroll to bottom",
                "click by label",
                "click player selectors",
            ]
        );
    }

    #[tokio::test]
    async fn observe_collects_matching_requests() {
        let urls = stream::iter(vec![
            "https://www.mujrozhlas.cz/static/app.js".to_string(),
            "https://cdn.croaod.cz/a/manifest.mpd".to_string(),
            "https://cdn.croaod.cz/a/segment_ctaudio_1_mpd.m4s".to_string(),
            "https://cdn.croaod.cz/b/file.mp3".to_string(),
            "https://cdn.croaod.cz/a/manifest.mpd".to_string(),
        ]);
        let mut found = CandidateList::new();

        let added = observe(urls, Duration::from_secs(5), &mut found).await;

        assert_eq!(added, 2);
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn observe_stops_after_window() {
        let urls = stream::iter(vec!["https://cdn.croaod.cz/a/manifest.mpd".to_string()])
            .chain(stream::pending());
        let mut found = CandidateList::new();

        let added = tokio::time::timeout(
            Duration::from_secs(5),
            observe(urls, Duration::from_millis(50), &mut found),
        )
        .await
        .expect("observation window was not enforced");

        assert_eq!(added, 1);
    }

    #[tokio::test]
    async fn observe_keeps_earlier_candidates() {
        let mut found = CandidateList::new();
        found.offer("https://cdn.croaod.cz/a/manifest.mpd");

        let urls = stream::iter(vec![
            "https://cdn.croaod.cz/b/manifest.mpd".to_string(),
            "https://cdn.croaod.cz/a/manifest.mpd".to_string(),
        ]);
        let added = observe(urls, Duration::from_secs(1), &mut found).await;

        assert_eq!(added, 1);
        let urls: Vec<_> = found.into_vec().into_iter().map(|c| c.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.croaod.cz/a/manifest.mpd",
                "https://cdn.croaod.cz/b/manifest.mpd"
            ]
        );
    }
}
