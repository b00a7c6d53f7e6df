//! Playable recitation tracks.
//!
//! A [`Track`] is an immutable value: once placed in a queue it is never
//! mutated, and two tracks are the same track when their ids match. The
//! resource locator may be relative to the archive origin and is resolved
//! with [`Track::resolve`] before anything is fetched.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DurationSecondsWithFrac};
use url::Url;

use crate::error::{Error, Result};

/// A recitation as returned by the content query service.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Stable identity of the recording.
    pub id: String,
    pub title: String,
    pub reciter_name: String,

    /// Resource locator of the audio, absolute or relative to the origin.
    pub src: String,

    pub surah_number: Option<u16>,
    pub ayah_start: Option<u16>,
    pub ayah_end: Option<u16>,

    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub duration: Option<Duration>,
}

impl Track {
    /// Creates a track with only the mandatory fields set.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        reciter_name: impl Into<String>,
        src: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            reciter_name: reciter_name.into(),
            src: src.into(),
            surah_number: None,
            ayah_start: None,
            ayah_end: None,
            duration: None,
        }
    }

    /// Resolves the resource locator against `origin` into an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the locator cannot be parsed, or when
    /// it resolves to something other than HTTP(S).
    pub fn resolve(&self, origin: &Url) -> Result<Url> {
        let url = origin.join(&self.src)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(Error::invalid_argument(format!(
                "track {self} has unsupported scheme {scheme}"
            ))),
        }
    }

    /// Whether this is the same recording as `other`.
    #[must_use]
    #[inline]
    pub fn is(&self, other: &Track) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: \"{} - {}\"", self.id, self.reciter_name, self.title)?;
        if let Some(surah) = self.surah_number {
            write!(f, " [{surah}")?;
            match (self.ayah_start, self.ayah_end) {
                (Some(start), Some(end)) => write!(f, ":{start}-{end}]"),
                (Some(start), None) => write!(f, ":{start}]"),
                _ => write!(f, "]"),
            }?;
        }
        Ok(())
    }
}
