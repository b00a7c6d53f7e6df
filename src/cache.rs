//! Named, versioned response caches.
//!
//! A [`CacheStorage`] holds any number of named partitions, each mapping
//! request URLs to stored responses. The cache agent uses three of them
//! (static shell, dynamic API, audio) and deletes the rest on activation.
//!
//! # Persistence
//!
//! When opened with a root directory, every entry is written to disk as a
//! pair of files named after the MD5 digest of its URL:
//!
//! ```text
//! <root>/<partition>/<md5(url)>.json   status, headers, URL
//! <root>/<partition>/<md5(url)>.body   response body
//! ```
//!
//! On open only the metadata is read; bodies stay on disk until matched.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use http::{HeaderName, HeaderValue};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs;
use url::Url;

use crate::{error::Result, http::Response};

/// Stored metadata of a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Meta {
    url: Url,
    status: u16,
    headers: Vec<(String, String)>,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
enum Body {
    Memory(Arc<Vec<u8>>),
    Disk(PathBuf),
}

#[derive(Clone, Debug)]
struct Entry {
    meta: Meta,
    body: Body,
    size: u64,
}

type Partition = BTreeMap<String, Entry>;

/// Response caches shared between the tasks of the cache agent.
#[derive(Debug)]
pub struct CacheStorage {
    root: Option<PathBuf>,
    partitions: Mutex<BTreeMap<String, Partition>>,
}

impl CacheStorage {
    /// Creates caches that live in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            root: None,
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the caches persisted under `root`, creating it when missing.
    ///
    /// Entries whose metadata cannot be read are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created or listed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut partitions = BTreeMap::new();
        let mut dirs = fs::read_dir(&root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = dir.file_name().into_string() else {
                continue;
            };

            let partition = load_partition(&dir.path()).await?;
            debug!("cache {name} holds {} entries", partition.len());
            partitions.insert(name, partition);
        }

        Ok(Self {
            root: Some(root),
            partitions: Mutex::new(partitions),
        })
    }

    /// Names of all partitions.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.partitions.lock()?.keys().cloned().collect())
    }

    /// Creates the partition `name` if it does not exist yet.
    pub async fn open_partition(&self, name: &str) -> Result<()> {
        if let Some(dir) = self.partition_dir(name) {
            fs::create_dir_all(dir).await?;
        }
        self.partitions.lock()?.entry(name.to_owned()).or_default();
        Ok(())
    }

    /// Deletes the partition `name` and everything in it. Returns whether it
    /// existed.
    pub async fn delete_partition(&self, name: &str) -> Result<bool> {
        let existed = self.partitions.lock()?.remove(name).is_some();
        if let Some(dir) = self.partition_dir(name) {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(existed)
    }

    /// Whether `partition` holds a response for `url`.
    pub fn contains(&self, partition: &str, url: &Url) -> Result<bool> {
        Ok(self
            .partitions
            .lock()?
            .get(partition)
            .is_some_and(|entries| entries.contains_key(url.as_str())))
    }

    /// Number of entries in `partition`.
    pub fn len(&self, partition: &str) -> Result<usize> {
        Ok(self
            .partitions
            .lock()?
            .get(partition)
            .map_or(0, BTreeMap::len))
    }

    /// Stores `response` for `url` in `partition`, replacing an earlier
    /// entry. Returns the size of the stored body.
    pub async fn put(&self, partition: &str, url: &Url, response: &Response) -> Result<u64> {
        let meta = Meta {
            url: url.clone(),
            status: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_owned()))
                })
                .collect(),
            stored_at: OffsetDateTime::now_utc(),
        };
        let size = u64::try_from(response.body().len()).unwrap_or(u64::MAX);

        let body = match self.partition_dir(partition) {
            Some(dir) => {
                fs::create_dir_all(&dir).await?;
                let (meta_path, body_path) = entry_paths(&dir, url);
                fs::write(&body_path, response.body()).await?;
                fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;
                Body::Disk(body_path)
            }
            None => Body::Memory(Arc::new(response.body().clone())),
        };

        self.partitions
            .lock()?
            .entry(partition.to_owned())
            .or_default()
            .insert(url.to_string(), Entry { meta, body, size });

        trace!("cached {url} in {partition} ({size} bytes)");
        Ok(size)
    }

    /// Looks up `url` in `partition`.
    pub async fn match_url(&self, partition: &str, url: &Url) -> Result<Option<Response>> {
        let entry = self
            .partitions
            .lock()?
            .get(partition)
            .and_then(|entries| entries.get(url.as_str()))
            .cloned();

        match entry {
            Some(entry) => self.read(partition, url, entry).await,
            None => Ok(None),
        }
    }

    /// Size of the body stored for `url` in `partition`.
    pub fn size(&self, partition: &str, url: &Url) -> Result<Option<u64>> {
        Ok(self
            .partitions
            .lock()?
            .get(partition)
            .and_then(|entries| entries.get(url.as_str()))
            .map(|entry| entry.size))
    }

    /// Removes `url` from `partition`. Returns whether it was cached.
    pub async fn delete(&self, partition: &str, url: &Url) -> Result<bool> {
        let removed = self
            .partitions
            .lock()?
            .get_mut(partition)
            .and_then(|entries| entries.remove(url.as_str()));

        if let (Some(_), Some(dir)) = (&removed, self.partition_dir(partition)) {
            let (meta_path, body_path) = entry_paths(&dir, url);
            for path in [meta_path, body_path] {
                match fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(removed.is_some())
    }

    async fn read(&self, partition: &str, url: &Url, entry: Entry) -> Result<Option<Response>> {
        let body = match entry.body {
            Body::Memory(body) => body.as_ref().clone(),
            Body::Disk(path) => match fs::read(&path).await {
                Ok(body) => body,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("cached body of {url} vanished from {partition}");
                    if let Some(entries) = self.partitions.lock()?.get_mut(partition) {
                        entries.remove(url.as_str());
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let mut response = http::Response::builder().status(entry.meta.status);
        if let Some(headers) = response.headers_mut() {
            for (name, value) in &entry.meta.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.append(name, value);
                }
            }
        }

        Ok(Some(response.body(body)?))
    }

    fn partition_dir(&self, name: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(name))
    }
}

/// Metadata and body paths of the entry for `url` in `dir`.
fn entry_paths(dir: &Path, url: &Url) -> (PathBuf, PathBuf) {
    let digest = format!("{:x}", Md5::digest(url.as_str().as_bytes()));
    (
        dir.join(format!("{digest}.json")),
        dir.join(format!("{digest}.body")),
    )
}

async fn load_partition(dir: &Path) -> Result<Partition> {
    let mut partition = Partition::new();
    let mut files = fs::read_dir(dir).await?;
    while let Some(file) = files.next_entry().await? {
        let path = file.path();
        if path.extension().is_none_or(|extension| extension != "json") {
            continue;
        }

        let meta: Meta = match fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("skipping cache entry {}: {e}", path.display());
                    continue;
                }
            },
            Err(e) => {
                warn!("skipping cache entry {}: {e}", path.display());
                continue;
            }
        };

        let body_path = path.with_extension("body");
        let size = match fs::metadata(&body_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                warn!("skipping cache entry {} without body", path.display());
                continue;
            }
        };

        partition.insert(
            meta.url.to_string(),
            Entry {
                meta,
                body: Body::Disk(body_path),
                size,
            },
        );
    }
    Ok(partition)
}
