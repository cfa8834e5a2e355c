use std::{str::FromStr, sync::LazyLock, time::Duration};

use quick_xml::{events::Event, Reader};
use regex::Regex;
use reqwest::Url;

use crate::util;

/// Filename prefix of the CDN's DASH segments. Everything before it is the
/// directory holding the manifest.
pub const SEGMENT_TOKEN: &str = "segment_";
pub const MANIFEST_NAME: &str = "manifest.mpd";

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^P(?:\d+Y)?(?:\d+M)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("valid duration pattern")
});

#[derive(thiserror::Error, Debug)]
pub enum DeriveError {
    #[error("cannot derive manifest from {url}: {reason}")]
    CannotDerive { url: String, reason: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum InspectError {
    #[error("could not fetch manifest: {0}")]
    Fetch(#[from] util::DownloadError),
    #[error("could not parse manifest: {0}")]
    Parse(#[from] quick_xml::Error),
}

/// Rebuilds the manifest URL of a DASH segment URL.
///
/// `https://cdn.croaod.cz/abc/segment_ctaudio_xyz_mpd.m4s` becomes
/// `https://cdn.croaod.cz/abc/manifest.mpd`. Query and fragment are dropped.
pub fn derive_manifest_url(segment_url: &str) -> Result<String, DeriveError> {
    let cannot = |reason| DeriveError::CannotDerive {
        url: segment_url.to_string(),
        reason,
    };

    let mut url = Url::parse(segment_url).map_err(|_| cannot("not a valid URL"))?;
    let path = url.path().to_string();
    let dir_end = path.rfind('/').map(|i| i + 1).unwrap_or(0);

    if path[dir_end..].starts_with(SEGMENT_TOKEN) {
        url.set_path(&format!("{}{}", &path[..dir_end], MANIFEST_NAME));
    } else if path[dir_end..] == *MANIFEST_NAME {
        // already a manifest of this layout
    } else {
        return Err(cannot("filename does not start with \"segment_\""));
    }

    url.set_query(None);
    url.set_fragment(None);

    Ok(url.to_string())
}

#[derive(Debug, Default)]
pub struct Manifest {
    pub is_dynamic: bool,
    pub duration: Option<Duration>,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub codecs: Option<String>,
    pub bandwidth: Option<u64>,
    pub sampling_rate: Option<u32>,
}

fn get_attr<T>(e: &quick_xml::events::BytesStart, attr: &str) -> Option<T>
where
    T: FromStr,
{
    e.try_get_attribute(attr)
        .ok()?
        .and_then(|a| std::str::from_utf8(&a.value).ok()?.parse().ok())
}

impl Representation {
    fn from_event(e: &quick_xml::events::BytesStart) -> Self {
        Self {
            id: get_attr(e, "id").unwrap_or_default(),
            codecs: get_attr(e, "codecs"),
            bandwidth: get_attr(e, "bandwidth"),
            sampling_rate: get_attr(e, "audioSamplingRate"),
        }
    }
}

impl Manifest {
    /// Highest-bandwidth representation, which is what ffmpeg picks by default.
    pub fn best(&self) -> Option<&Representation> {
        self.representations
            .iter()
            .max_by_key(|r| r.bandwidth.unwrap_or(0))
    }
}

pub fn parse_manifest(manifest: &str) -> Result<Manifest, quick_xml::Error> {
    let mut reader = Reader::from_str(manifest);
    reader.trim_text(true);

    let mut m = Manifest::default();

    loop {
        match reader.read_event() {
            Err(e) => return Err(e),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"MPD" => {
                    m.is_dynamic = get_attr::<String>(&e, "type")
                        .map(|t| t == "dynamic")
                        .unwrap_or(false);
                    m.duration = get_attr::<String>(&e, "mediaPresentationDuration")
                        .as_deref()
                        .and_then(parse_iso_duration);
                }
                b"Representation" => m.representations.push(Representation::from_event(&e)),
                _ => (),
            },
            _ => (),
        }
    }

    Ok(m)
}

/// Parses an ISO 8601 duration as used by `mediaPresentationDuration`, e.g.
/// `PT1H2M3.5S`. Year and month designators are not supported beyond zero.
pub fn parse_iso_duration(s: &str) -> Option<Duration> {
    let caps = ISO_DURATION.captures(s.trim())?;
    if s.trim() == "P" || s.trim() == "PT" {
        return None;
    }

    let int = |i: usize| -> Option<u64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    let seconds = match caps.get(4) {
        Some(m) => parse_seconds(m.as_str())?,
        None => Duration::ZERO,
    };

    let whole = int(1)?
        .checked_mul(86_400)?
        .checked_add(int(2)?.checked_mul(3_600)?)?
        .checked_add(int(3)?.checked_mul(60)?)?;
    Duration::from_secs(whole).checked_add(seconds)
}

fn parse_seconds(s: &str) -> Option<Duration> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let nanos = format!("{:0<9}", &frac[..frac.len().min(9)]);
    Some(Duration::new(whole.parse().ok()?, nanos.parse().ok()?))
}

/// Fetches and parses a manifest.
pub async fn inspect(client: &util::HttpClient, url: &str) -> Result<Manifest, InspectError> {
    let text = client.fetch_text(url).await?;
    Ok(parse_manifest(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_from_segment() {
        assert_eq!(
            derive_manifest_url("https://cdn.croaod.cz/abc/segment_ctaudio_xyz_mpd.m4s").unwrap(),
            "https://cdn.croaod.cz/abc/manifest.mpd"
        );
        assert_eq!(
            derive_manifest_url(
                "https://cdn.croaod.cz/hls/a/b/segment_ctaudio_ridp0aa0br128000_cinit_mpd.m4s?x=1#t"
            )
            .unwrap(),
            "https://cdn.croaod.cz/hls/a/b/manifest.mpd"
        );
    }

    #[test]
    fn derive_is_idempotent() {
        let segment = "https://cdn.croaod.cz/abc/segment_ctaudio_xyz_mpd.m4s?token=abc";
        let once = derive_manifest_url(segment).unwrap();
        let twice = derive_manifest_url(segment).unwrap();
        assert_eq!(once, twice);
        assert!(once.ends_with(".mpd"));
        assert_eq!(derive_manifest_url(&once).unwrap(), once);
    }

    #[test]
    fn derive_requires_token() {
        for url in [
            "https://cdn.croaod.cz/abc/chunk_1.m4s",
            "https://cdn.croaod.cz/segment_dir/chunk.m4s",
            "https://cdn.croaod.cz/",
            "garbage",
        ] {
            match derive_manifest_url(url) {
                Err(DeriveError::CannotDerive { url: u, .. }) => assert_eq!(u, url),
                Ok(m) => panic!("derived {} from {}", m, url),
            }
        }
    }

    #[test]
    fn iso_durations() {
        assert_eq!(parse_iso_duration("PT30S"), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_iso_duration("PT1H2M3.5S"),
            Some(Duration::from_millis(3_723_500))
        );
        assert_eq!(
            parse_iso_duration("P0Y0M0DT0H28M11.040S"),
            Some(Duration::from_millis(1_691_040))
        );
        assert_eq!(parse_iso_duration("P1D"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_iso_duration("PT"), None);
        assert_eq!(parse_iso_duration("1H"), None);
    }

    #[test]
    fn iso_durations_out_of_range() {
        assert_eq!(parse_iso_duration("P1DT18446744073709551615S"), None);
        assert_eq!(parse_iso_duration("P999999999999999D"), None);
        assert_eq!(parse_iso_duration("PT99999999999999999999S"), None);
        assert_eq!(parse_iso_duration("PT18446744073709551615H"), None);

        let manifest =
            super::parse_manifest(r#"<MPD mediaPresentationDuration="P1DT18446744073709551615S"></MPD>"#)
                .unwrap();
        assert_eq!(manifest.duration, None);
    }

    #[test]
    fn parse_manifest() {
        // Read the test file
        let fname = "manifest.mpd";
        let mut d = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        d.push("resources/test/");
        d.push(fname);
        let test_string =
            std::fs::read_to_string(d).expect(format!("Could not read {}", fname).as_str());

        let manifest = super::parse_manifest(&test_string).expect("Could not parse manifest");

        assert!(!manifest.is_dynamic);
        assert_eq!(manifest.duration, Some(Duration::from_millis(1_691_040)));
        assert_eq!(manifest.representations.len(), 2);

        let best = manifest.best().expect("No representations found");
        assert_eq!(best.id, "1");
        assert_eq!(best.bandwidth, Some(192_000));
        assert_eq!(best.codecs.as_deref(), Some("mp4a.40.2"));
        assert_eq!(best.sampling_rate, Some(48_000));
    }
}
