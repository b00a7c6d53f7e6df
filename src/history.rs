//! Playback history and resume positions.
//!
//! Every playback start appends a [`HistoryEntry`]; the oldest entries are
//! evicted once the soft cap is reached. Independently, the offset of the
//! playing track is saved periodically so that playback can resume where it
//! stopped the next time the track is loaded.

use std::{collections::BTreeMap, collections::VecDeque, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    error::Result,
    storage::{Namespace, Storage},
    track::Track,
};

/// Minimum interval between two persisted position updates.
pub const POSITION_INTERVAL: Duration = Duration::from_secs(2);

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub track_id: String,
    pub title: String,
    pub reciter_name: String,
    pub surah_number: Option<u16>,
    pub src: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&Track> for HistoryEntry {
    fn from(track: &Track) -> Self {
        Self {
            track_id: track.id.clone(),
            title: track.title.clone(),
            reciter_name: track.reciter_name.clone(),
            surah_number: track.surah_number,
            src: track.src.clone(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub struct History {
    storage: Arc<dyn Storage>,
    entries: VecDeque<HistoryEntry>,
    /// Last offset in seconds, by track id.
    positions: BTreeMap<String, f64>,
    limit: usize,
    last_saved: Option<Instant>,
}

impl History {
    /// Loads history and positions from `storage`, keeping at most `limit`
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn open(storage: Arc<dyn Storage>, limit: usize) -> Result<Self> {
        let mut entries: VecDeque<HistoryEntry> =
            storage.load(Namespace::History)?.unwrap_or_default();
        let positions = storage.load(Namespace::Positions)?.unwrap_or_default();

        let limit = limit.max(1);
        while entries.len() > limit {
            entries.pop_front();
        }

        Ok(Self {
            storage,
            entries,
            positions,
            limit,
            last_saved: None,
        })
    }

    /// Appends `track` to the history.
    pub fn record(&mut self, track: &Track) -> Result<()> {
        self.entries.push_back(HistoryEntry::from(track));
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }

        // New track, new tick stream.
        self.last_saved = None;

        self.storage.save(Namespace::History, &self.entries)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// The `n` most recent entries, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<&HistoryEntry> {
        self.entries.iter().rev().take(n).collect()
    }

    /// Empties the history. Saved positions are kept.
    pub fn clear_history(&mut self) -> Result<()> {
        self.entries.clear();
        self.storage.save(Namespace::History, &self.entries)
    }

    #[must_use]
    pub fn position(&self, track_id: &str) -> Option<Duration> {
        self.positions
            .get(track_id)
            .and_then(|&secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// The offset to resume `track_id` from, if it lies beyond `threshold`.
    #[must_use]
    pub fn resume_position(&self, track_id: &str, threshold: Duration) -> Option<Duration> {
        self.position(track_id).filter(|&offset| offset > threshold)
    }

    /// Records the offset of `track_id` unless one was saved less than
    /// [`POSITION_INTERVAL`] before `now`. Returns whether it was saved.
    pub fn update_position(&mut self, track_id: &str, offset: Duration, now: Instant) -> Result<bool> {
        if self
            .last_saved
            .is_some_and(|last| now.duration_since(last) < POSITION_INTERVAL)
        {
            return Ok(false);
        }

        self.last_saved = Some(now);
        self.save_position(track_id, offset)?;
        Ok(true)
    }

    /// Records the offset of `track_id` immediately.
    pub fn save_position(&mut self, track_id: &str, offset: Duration) -> Result<()> {
        self.positions
            .insert(track_id.to_owned(), crate::util::as_secs_rounded(offset));
        self.storage.save(Namespace::Positions, &self.positions)
    }

    /// Drops the saved offset of a track that played to its end.
    pub fn forget_position(&mut self, track_id: &str) -> Result<()> {
        if self.positions.remove(track_id).is_some() {
            self.storage.save(Namespace::Positions, &self.positions)?;
        }
        Ok(())
    }
}
