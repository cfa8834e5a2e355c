use std::{path::PathBuf, time::Duration};

use reqwest::Url;

use crate::{probe::ProbeOptions, source};

/// Used when a URL yields nothing usable as a file name.
pub const FALLBACK_NAME: &str = "mujrozhlas";

/// Everything one run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct Job {
    pub source: String,
    pub output: PathBuf,
    pub keep_parts: bool,
    /// Explicit ffmpeg path; searched for when absent.
    pub ffmpeg: Option<PathBuf>,
    /// Upper bound for one real-time recording.
    pub record_timeout: Option<Duration>,
    /// Where the per-run parts directory is created; the system temp dir
    /// when absent.
    pub parts_dir: Option<PathBuf>,
    pub probe: ProbeOptions,
}

impl Job {
    pub fn new(source: impl Into<String>, output: Option<PathBuf>, keep_parts: bool) -> Self {
        let source = source.into();
        let output = output.unwrap_or_else(|| PathBuf::from(output_name(&source)));

        Self {
            source,
            output,
            keep_parts,
            ffmpeg: None,
            record_timeout: None,
            parts_dir: None,
            probe: ProbeOptions::default(),
        }
    }

    /// Referer sent with stream requests: the page itself when one was given,
    /// the site's home page for bare CDN URLs.
    pub fn referer(&self) -> String {
        match Url::parse(&self.source) {
            Ok(url) if !source::is_cdn_url(&url) => self.source.clone(),
            _ => crate::util::HOME_URL.to_string(),
        }
    }
}

/// Derives `<name>.mp3` from a URL. On the CDN the stream file itself is
/// generic (`manifest.mpd`, `segment_...m4s`), so the directory holding it
/// names the episode; for pages the last path segment does.
pub fn output_name(url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|u| {
        let segments: Vec<String> = u
            .path_segments()?
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let pick = if source::is_cdn_url(&u) && segments.len() >= 2 {
            segments.len() - 2
        } else {
            segments.len().checked_sub(1)?
        };
        segments.into_iter().nth(pick)
    });

    let name = segment
        .map(|s| match urlencoding::decode(&s) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => s.clone(),
        })
        .map(|s| sanitize_filename(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string());

    format!("{}.mp3", name)
}

/// Replaces characters that are unsafe in file names on common platforms and
/// trims leading/trailing dots and spaces.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    replaced.trim_matches(|c| c == '.' || c == ' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_from_cdn_urls() {
        assert_eq!(output_name("https://cdn.croaod.cz/abc/manifest.mpd"), "abc.mp3");
        assert_eq!(
            output_name("https://cdn.croaod.cz/abc/segment_ctaudio_xyz_mpd.m4s"),
            "abc.mp3"
        );
        assert_eq!(
            output_name("https://cdn.croaod.cz/x/abc/episode.mp3?t=1"),
            "abc.mp3"
        );
        assert_eq!(
            output_name("https://cdn.croaod.cz/manifest.mpd"),
            "manifest.mpd.mp3"
        );
    }

    #[test]
    fn names_from_pages() {
        assert_eq!(
            output_name("https://www.mujrozhlas.cz/povidka/hrbitov-zvirat"),
            "hrbitov-zvirat.mp3"
        );
        assert_eq!(
            output_name("https://www.mujrozhlas.cz/povidka/hrbitov-zvirat/"),
            "hrbitov-zvirat.mp3"
        );
        assert_eq!(
            output_name("https://www.mujrozhlas.cz/p%C5%99%C3%ADb%C4%9Bh"),
            "příběh.mp3"
        );
        assert_eq!(output_name("https://www.mujrozhlas.cz/"), "mujrozhlas.mp3");
        assert_eq!(output_name("not a url"), "mujrozhlas.mp3");
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename(" ..name.. "), "name");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename("..."), "");
    }

    #[test]
    fn referer_follows_source() {
        let page = Job::new("https://www.mujrozhlas.cz/povidka/x", None, false);
        assert_eq!(page.referer(), "https://www.mujrozhlas.cz/povidka/x");
        assert_eq!(page.output, PathBuf::from("x.mp3"));

        let direct = Job::new(
            "https://cdn.croaod.cz/abc/manifest.mpd",
            Some(PathBuf::from("out.mp3")),
            true,
        );
        assert_eq!(direct.referer(), crate::util::HOME_URL);
        assert_eq!(direct.output, PathBuf::from("out.mp3"));
        assert!(direct.keep_parts);
    }
}
