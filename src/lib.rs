//! # croaod-dl
//!
//! This crate archives episodes from [mujrozhlas.cz](https://www.mujrozhlas.cz).
//! The site's player streams audio from the `croaod.cz` CDN, either as DASH
//! manifests or as plain MP3 files, and only requests them after somebody
//! presses play. `croaod-dl` opens the page in a headless Chromium, presses
//! play, collects the CDN URLs the player asks for, records or downloads each
//! one and merges the results into a single MP3 with ffmpeg.
//!
//! ## Usage
//!
//! The `pipeline` module runs the whole thing for one URL. A page URL is
//! probed in the browser, a CDN manifest or MP3 URL is used directly, and a
//! CDN segment URL is turned into its manifest first.
//!
//! ```no_run
//! use croaod_dl::{job::Job, pipeline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let job = Job::new("https://www.mujrozhlas.cz/povidka/...", None, false);
//!
//!     match pipeline::run(&job).await {
//!         Ok(summary) => println!("Saved {}", summary.output.display()),
//!         Err(e) => eprintln!("Error: {}", e),
//!     }
//! }
//! ```
//!
//! The lower-level pieces can be used on their own: `source::classify` decides
//! how a URL is handled, `dash::derive_manifest_url` maps a segment to its
//! manifest, and `probe::probe` returns the stream URLs a page requests.

#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod dash;
pub mod ffmpeg;
pub mod job;
pub mod pipeline;
pub mod probe;
pub mod source;
pub mod stats;
pub mod util;
