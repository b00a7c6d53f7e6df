//! Runtime configuration.
//!
//! Configuration is read from a TOML file (see `murattal.toml.example`);
//! every key is optional and falls back to the defaults below. Command line
//! arguments override the file in the binary.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use url::Url;

use crate::error::{Error, Result};

/// Versions and contents of the three cache partitions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version tag of the static shell partition.
    pub static_version: String,
    /// Version tag of the dynamic API partition.
    pub dynamic_version: String,
    /// Version tag of the audio partition.
    pub audio_version: String,

    /// Shell assets fetched into the static partition on install, relative
    /// to the origin.
    pub precache: Vec<String>,

    /// Page served to navigations when both cache and network fail.
    pub offline_page: String,

    /// Path prefixes that identify API requests.
    pub api_prefixes: Vec<String>,

    /// Hosts whose every request is an API request.
    pub api_hosts: Vec<String>,

    /// Whether cache partitions are persisted under the data directory.
    pub persistent: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_version: "v3".to_owned(),
            dynamic_version: "v3".to_owned(),
            audio_version: "v1".to_owned(),
            precache: vec![
                "/".to_owned(),
                "/offline.html".to_owned(),
                "/manifest.json".to_owned(),
            ],
            offline_page: "/offline.html".to_owned(),
            api_prefixes: vec!["/api/".to_owned(), "/rest/v1/".to_owned()],
            api_hosts: Vec::new(),
            persistent: true,
        }
    }
}

/// Crossfade and resume behaviour of the audio output.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Ramp volume on transitions; when off, volume changes are instant.
    pub crossfade: bool,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "fade_in_ms")]
    pub fade_in: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "fade_out_ms")]
    pub fade_out: Duration,

    /// Fade before a manual next/previous.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "skip_fade_ms")]
    pub skip_fade: Duration,

    /// Saved offsets at or below this are not resumed.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "resume_threshold_secs")]
    pub resume_threshold: Duration,

    /// Initial equalizer gains in dB: bass, mid, treble.
    pub equalizer: [f32; 3],
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            crossfade: true,
            fade_in: Duration::from_millis(1000),
            fade_out: Duration::from_millis(400),
            skip_fade: Duration::from_millis(500),
            resume_threshold: Duration::from_secs(5),
            equalizer: [0.0; 3],
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub app_name: String,
    #[serde(skip)]
    pub app_version: String,
    #[serde(skip)]
    pub user_agent: String,

    /// Origin that relative resource locators resolve against.
    pub origin: Url,

    /// Directory for the registry and persistent caches.
    pub data_dir: PathBuf,

    pub cache: CacheConfig,
    pub playback: PlaybackConfig,

    /// Soft deadline after which an unanswered download is given up.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "download_timeout_secs")]
    pub download_timeout: Duration,

    /// Soft cap of the playback history.
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let user_agent = user_agent(&app_name, &app_version);

        Self {
            app_name,
            app_version,
            user_agent,

            // Infallible: the literal is a valid URL.
            origin: Url::parse("http://localhost:3000/").expect("default origin is invalid"),
            data_dir: PathBuf::from(".murattal"),

            cache: CacheConfig::default(),
            playback: PlaybackConfig::default(),

            download_timeout: Duration::from_secs(30),
            history_limit: 50,
        }
    }
}

impl Config {
    /// Reads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds an origin that is not HTTP(S).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Names of the cache partitions of this configuration, in static,
    /// dynamic, audio order.
    #[must_use]
    pub fn cache_names(&self) -> [String; 3] {
        [
            format!("static-{}", self.cache.static_version),
            format!("dynamic-{}", self.cache.dynamic_version),
            format!("audio-{}", self.cache.audio_version),
        ]
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;

        if !matches!(config.origin.scheme(), "http" | "https") {
            return Err(Error::invalid_argument(format!(
                "origin {} is not http(s)",
                config.origin
            )));
        }

        let mut equalizer = config.playback.equalizer;
        for gain in &mut equalizer {
            *gain = gain.clamp(-crate::equalizer::MAX_GAIN_DB, crate::equalizer::MAX_GAIN_DB);
        }

        Ok(Self {
            playback: PlaybackConfig {
                equalizer,
                ..config.playback
            },
            ..config
        })
    }
}

/// Builds the `User-Agent` header value.
fn user_agent(app_name: &str, app_version: &str) -> String {
    let os_name = match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    };
    let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

    // `/` and `;` would break the product token grammar.
    let clean = |s: &str| s.replace(['/', ';'], "_");
    let user_agent = format!(
        "{}/{} (Rust; {}/{})",
        clean(app_name),
        clean(app_version),
        clean(os_name),
        clean(&os_version)
    );
    trace!("user agent: {user_agent}");
    user_agent
}
