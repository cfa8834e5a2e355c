use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use reqwest::Url;

use crate::dash;

/// Hosts of the mujrozhlas.cz audio CDN.
static CDN_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|\.)croaod\.cz$").expect("valid host pattern"));

pub const MANIFEST_EXT: &str = ".mpd";
pub const AUDIO_EXT: &str = ".mp3";
pub const SEGMENT_EXT: &str = ".m4s";

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Finished MP3 file, downloaded as is.
    Audio,
    /// DASH manifest, recorded through ffmpeg.
    Manifest,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Audio => "MP3",
            StreamKind::Manifest => "DASH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub kind: StreamKind,
}

impl Candidate {
    /// Builds a candidate from a URL on the CDN that points at a manifest or an
    /// MP3 file. Anything else yields `None`.
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        if !is_cdn_url(&parsed) {
            return None;
        }

        stream_kind(parsed.path()).map(|kind| Self {
            url: url.to_string(),
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Explore the URL as a web page and sniff the player's requests.
    PageScrape,
    /// The URL itself is a stream.
    Direct(Candidate),
    /// The URL is one segment of a DASH stream; the manifest must be derived.
    SegmentDerive,
}

pub fn classify(url: &str) -> Result<Mode, SourceError> {
    let parsed = Url::parse(url).map_err(|e| SourceError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => (),
        other => {
            return Err(SourceError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {:?}", other),
            })
        }
    }

    if !is_cdn_url(&parsed) {
        return Ok(Mode::PageScrape);
    }

    if has_extension(parsed.path(), SEGMENT_EXT) {
        return Ok(Mode::SegmentDerive);
    }

    Ok(match stream_kind(parsed.path()) {
        Some(kind) => Mode::Direct(Candidate {
            url: url.to_string(),
            kind,
        }),
        None => Mode::PageScrape,
    })
}

pub fn is_cdn_host(host: &str) -> bool {
    CDN_HOST.is_match(host)
}

pub(crate) fn is_cdn_url(url: &Url) -> bool {
    url.host_str().map(is_cdn_host).unwrap_or(false)
}

fn has_extension(path: &str, ext: &str) -> bool {
    path.to_ascii_lowercase().ends_with(ext)
}

fn stream_kind(path: &str) -> Option<StreamKind> {
    if has_extension(path, MANIFEST_EXT) {
        Some(StreamKind::Manifest)
    } else if has_extension(path, AUDIO_EXT) {
        Some(StreamKind::Audio)
    } else {
        None
    }
}

/// Candidates in order of first appearance, each URL at most once.
#[derive(Debug, Default)]
pub struct CandidateList {
    seen: HashSet<String>,
    items: Vec<Candidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate unless its URL was already seen. Returns whether it was
    /// added.
    pub fn push(&mut self, candidate: Candidate) -> bool {
        if !self.seen.insert(candidate.url.clone()) {
            return false;
        }
        self.items.push(candidate);
        true
    }

    /// Considers a URL observed on the network. CDN manifests and MP3 files are
    /// taken as they are, CDN segments are mapped to their manifest.
    pub fn offer(&mut self, url: &str) -> bool {
        if let Some(candidate) = Candidate::from_url(url) {
            return self.push(candidate);
        }

        let is_segment = Url::parse(url)
            .map(|u| is_cdn_url(&u) && has_extension(u.path(), SEGMENT_EXT))
            .unwrap_or(false);
        if !is_segment {
            return false;
        }

        match dash::derive_manifest_url(url) {
            Ok(manifest) => self.push(Candidate {
                url: manifest,
                kind: StreamKind::Manifest,
            }),
            Err(e) => {
                debug!("Ignoring segment request: {}", e);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Candidate> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_direct_streams() {
        for (url, kind) in [
            ("https://cdn.croaod.cz/abc/manifest.mpd", StreamKind::Manifest),
            ("https://croaod.cz/x/y/Manifest.MPD", StreamKind::Manifest),
            ("https://cdn.croaod.cz/abc/manifest.mpd?token=1", StreamKind::Manifest),
            ("https://media.cdn.croaod.cz/ep/episode.mp3", StreamKind::Audio),
        ] {
            assert_eq!(
                classify(url).unwrap(),
                Mode::Direct(Candidate {
                    url: url.to_string(),
                    kind
                }),
                "{}",
                url
            );
        }
    }

    #[test]
    fn classify_segments() {
        assert_eq!(
            classify("https://cdn.croaod.cz/abc/segment_ctaudio_xyz_mpd.m4s").unwrap(),
            Mode::SegmentDerive
        );
        assert_eq!(
            classify("http://croaod.cz/abc/segment_1.M4S?x=y").unwrap(),
            Mode::SegmentDerive
        );
    }

    #[test]
    fn classify_pages() {
        for url in [
            "https://www.mujrozhlas.cz/povidka/nejaka-epizoda",
            "https://example.com/manifest.mpd",
            "https://notcroaod.cz/abc/manifest.mpd",
            "https://example.com/segment_a.m4s",
            "https://cdn.croaod.cz/abc/",
            "https://cdn.croaod.cz/abc/index.html",
        ] {
            assert_eq!(classify(url).unwrap(), Mode::PageScrape, "{}", url);
        }
    }

    #[test]
    fn classify_rejects_bad_input() {
        assert!(classify("ftp://cdn.croaod.cz/abc/manifest.mpd").is_err());
        assert!(classify("file:///tmp/a.mp3").is_err());
        assert!(classify("not a url").is_err());
        assert!(classify("").is_err());
    }

    #[test]
    fn cdn_hosts() {
        assert!(is_cdn_host("croaod.cz"));
        assert!(is_cdn_host("cdn.croaod.cz"));
        assert!(is_cdn_host("CDN.CROAOD.CZ"));
        assert!(!is_cdn_host("croaod.cz.evil.com"));
        assert!(!is_cdn_host("xcroaod.cz"));
    }

    #[test]
    fn push_keeps_first_occurrence() {
        let candidate = |name: &str| Candidate {
            url: format!("https://cdn.croaod.cz/{}/manifest.mpd", name),
            kind: StreamKind::Manifest,
        };

        let mut list = CandidateList::new();
        let added: Vec<bool> = ["c", "a", "c", "b", "a", "a", "d", "b"]
            .iter()
            .map(|n| list.push(candidate(n)))
            .collect();

        assert_eq!(
            added,
            vec![true, true, false, true, false, false, true, false]
        );
        assert_eq!(
            list.into_vec(),
            vec![candidate("c"), candidate("a"), candidate("b"), candidate("d")]
        );
        assert!(CandidateList::new().is_empty());
    }

    #[test]
    fn offer_filters_and_dedups() {
        let mut list = CandidateList::new();
        assert!(list.offer("https://cdn.croaod.cz/a/manifest.mpd"));
        assert!(!list.offer("https://www.mujrozhlas.cz/static/player.js"));
        assert!(!list.offer("https://cdn.croaod.cz/a/manifest.mpd"));
        assert!(list.offer("https://cdn.croaod.cz/b/part.mp3"));
        assert!(!list.offer("https://other.cz/b/part.mp3"));
        // segment of an already known manifest
        assert!(!list.offer("https://cdn.croaod.cz/a/segment_ctaudio_1_mpd.m4s"));
        assert!(list.offer("https://cdn.croaod.cz/c/segment_ctaudio_1_mpd.m4s"));
        // segment without the naming convention
        assert!(!list.offer("https://cdn.croaod.cz/d/chunk1.m4s"));

        let items = list.into_vec();
        let urls: Vec<_> = items.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.croaod.cz/a/manifest.mpd",
                "https://cdn.croaod.cz/b/part.mp3",
                "https://cdn.croaod.cz/c/manifest.mpd",
            ]
        );
        assert_eq!(items[1].kind, StreamKind::Audio);
        assert_eq!(items[2].kind, StreamKind::Manifest);
    }
}
