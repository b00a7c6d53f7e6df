//! Durable registry of offline-available recitations.
//!
//! Two record sets are kept, each in its own storage namespace:
//! * downloaded tracks, keyed by track id (one entry per track, later
//!   downloads overwrite earlier ones)
//! * pending downloads, keyed by resource URL, which exist only between a
//!   download request and its resolution so that an interrupted session can
//!   retry them
//!
//! Promoting a pending record always removes it from the pending set.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use time::OffsetDateTime;
use url::Url;

use crate::{
    error::Result,
    storage::{Namespace, Storage},
    track::Track,
};

/// Metadata of a downloaded or pending recitation.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub title: String,
    pub reciter_name: String,
    pub audio_url: Url,
    pub surah_number: Option<u16>,
    #[serde(with = "time::serde::rfc3339")]
    pub downloaded_at: OffsetDateTime,
    /// Size of the cached body in bytes, once known.
    pub size: Option<u64>,
}

/// A fully cached track.
pub type DownloadedTrack = DownloadRecord;

/// A requested download that has not resolved yet.
pub type PendingDownload = DownloadRecord;

impl DownloadRecord {
    /// Creates a record for `track` cached from `audio_url`.
    #[must_use]
    pub fn new(track: &Track, audio_url: Url) -> Self {
        Self {
            id: track.id.clone(),
            title: track.title.clone(),
            reciter_name: track.reciter_name.clone(),
            audio_url,
            surah_number: track.surah_number,
            downloaded_at: OffsetDateTime::now_utc(),
            size: None,
        }
    }
}

/// Totals over all downloaded tracks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub count: usize,
    pub total_size_bytes: u64,
}

/// Registry of downloaded and pending tracks.
pub struct Registry {
    storage: Arc<dyn Storage>,
    downloaded: BTreeMap<String, DownloadedTrack>,
    pending: BTreeMap<String, PendingDownload>,
}

impl Registry {
    /// Loads both record sets from `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails. Corrupt records are
    /// dropped by the storage layer.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let downloaded: BTreeMap<String, DownloadedTrack> =
            storage.load(Namespace::Downloads)?.unwrap_or_default();
        let pending: BTreeMap<String, PendingDownload> =
            storage.load(Namespace::PendingDownloads)?.unwrap_or_default();
        debug!(
            "registry holds {} downloaded and {} pending tracks",
            downloaded.len(),
            pending.len()
        );

        Ok(Self {
            storage,
            downloaded,
            pending,
        })
    }

    #[must_use]
    pub fn is_downloaded(&self, track_id: &str) -> bool {
        self.downloaded.contains_key(track_id)
    }

    #[must_use]
    pub fn downloaded(&self, track_id: &str) -> Option<&DownloadedTrack> {
        self.downloaded.get(track_id)
    }

    /// All downloaded tracks, most recent first.
    #[must_use]
    pub fn downloads(&self) -> Vec<&DownloadedTrack> {
        let mut downloads: Vec<_> = self.downloaded.values().collect();
        downloads.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        downloads
    }

    #[must_use]
    pub fn pending(&self, url: &Url) -> Option<&PendingDownload> {
        self.pending.get(url.as_str())
    }

    pub fn pending_downloads(&self) -> impl Iterator<Item = &PendingDownload> {
        self.pending.values()
    }

    #[must_use]
    pub fn stats(&self) -> DownloadStats {
        DownloadStats {
            count: self.downloaded.len(),
            total_size_bytes: self.downloaded.values().filter_map(|d| d.size).sum(),
        }
    }

    /// Registers a pending download, replacing an earlier request for the
    /// same URL.
    pub fn add_pending(&mut self, record: PendingDownload) -> Result<()> {
        self.pending.insert(record.audio_url.to_string(), record);
        self.save_pending()
    }

    pub fn remove_pending(&mut self, url: &Url) -> Result<Option<PendingDownload>> {
        let removed = self.pending.remove(url.as_str());
        if removed.is_some() {
            self.save_pending()?;
        }
        Ok(removed)
    }

    /// Promotes the pending download for `url` to a downloaded track.
    ///
    /// Returns `None` when nothing was pending for `url`, which happens when
    /// the completion was already handled through another signal.
    pub fn promote(&mut self, url: &Url, size: Option<u64>) -> Result<Option<DownloadedTrack>> {
        let Some(mut record) = self.pending.remove(url.as_str()) else {
            return Ok(None);
        };

        record.downloaded_at = OffsetDateTime::now_utc();
        record.size = size.or(record.size);
        self.downloaded.insert(record.id.clone(), record.clone());

        self.save_downloaded()?;
        self.save_pending()?;
        Ok(Some(record))
    }

    /// Records the body size of the downloaded track cached from `url`, if
    /// it was not known yet. Returns whether a record was updated.
    pub fn update_size(&mut self, url: &Url, size: u64) -> Result<bool> {
        let record = self
            .downloaded
            .values_mut()
            .find(|record| &record.audio_url == url && record.size.is_none());
        let Some(record) = record else {
            return Ok(false);
        };

        record.size = Some(size);
        self.save_downloaded()?;
        Ok(true)
    }

    /// Removes the downloaded track with `track_id`.
    pub fn remove_downloaded(&mut self, track_id: &str) -> Result<Option<DownloadedTrack>> {
        let removed = self.downloaded.remove(track_id);
        if removed.is_some() {
            self.save_downloaded()?;
        }
        Ok(removed)
    }

    /// Drops pending records whose track is already downloaded from the same
    /// URL. Returns how many were dropped.
    pub fn reconcile(&mut self) -> Result<usize> {
        let before = self.pending.len();
        let downloaded = &self.downloaded;
        self.pending.retain(|url, record| {
            downloaded
                .get(&record.id)
                .is_none_or(|done| done.audio_url.as_str() != url)
        });

        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!("reconciled {dropped} stale pending downloads");
            self.save_pending()?;
        }
        Ok(dropped)
    }

    fn save_downloaded(&self) -> Result<()> {
        self.storage.save(Namespace::Downloads, &self.downloaded)
    }

    fn save_pending(&self) -> Result<()> {
        self.storage.save(Namespace::PendingDownloads, &self.pending)
    }
}
