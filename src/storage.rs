//! Synchronous key-value storage for session state.
//!
//! The session keeps small, durable records (transport snapshot, download
//! registry, history) in a string-keyed store that is read and written
//! synchronously from the event loop. Values are JSON documents; typed
//! access is layered on top through `load` and `save` on `dyn Storage`.
//!
//! Two backends exist:
//! * [`FileStorage`] - a single JSON file, rewritten on every change
//! * [`MemoryStorage`] - process memory only, for tests and ephemeral runs

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Prefix for every key written by this crate.
const KEY_PREFIX: &str = "murattal";

/// Namespaces under which records are persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Transport snapshot.
    Player,
    /// Fully cached tracks, keyed by track id.
    Downloads,
    /// Requested but unresolved downloads, keyed by URL.
    PendingDownloads,
    /// Playback history.
    History,
    /// Last played offsets, keyed by track id.
    Positions,
}

impl Namespace {
    /// Storage key of this namespace.
    #[must_use]
    pub fn key(self) -> String {
        let name = match self {
            Self::Player => "player",
            Self::Downloads => "downloads",
            Self::PendingDownloads => "pending-downloads",
            Self::History => "history",
            Self::Positions => "positions",
        };
        format!("{KEY_PREFIX}:{name}")
    }
}

/// String-keyed synchronous storage.
pub trait Storage: Send + Sync {
    /// Returns the raw value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing what was there.
    fn set(&self, key: &str, value: String) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed access to the namespaced records.
impl dyn Storage {
    /// Reads and deserializes the record in `namespace`.
    ///
    /// A record that no longer deserializes is logged and treated as absent,
    /// so that a schema change never prevents the session from starting.
    pub fn load<T>(&self, namespace: Namespace) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let key = namespace.key();
        let Some(raw) = self.get(&key)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("ignoring corrupt record {key}: {e}");
                Ok(None)
            }
        }
    }

    /// Serializes and writes `value` into `namespace`.
    pub fn save<T>(&self, namespace: Namespace, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value)?;
        self.set(&namespace.key(), raw)
    }
}

/// Storage that lives in process memory only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock()?.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock()?.remove(key);
        Ok(())
    }
}

/// Storage persisted to a single JSON file.
///
/// The whole map is kept in memory and written back through a temporary
/// file on every change, so a crash never leaves a half-written store.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// File name inside the data directory.
    pub const FILE_NAME: &'static str = "storage.json";

    /// Opens the store in `dir`, creating the directory when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be read. A file that is not valid JSON is discarded with a
    /// warning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("discarding unreadable storage {}: {e}", path.display());
                BTreeMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("opened storage {} with {} keys", path.display(), entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(entries)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.insert(key.to_owned(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn typed_records_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.save(Namespace::Positions, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<u32>> = storage.load(Namespace::Positions).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn corrupt_records_load_as_absent() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage
            .set(&Namespace::History.key(), "{not json".to_owned())
            .unwrap();
        let loaded: Option<Vec<u32>> = storage.load(Namespace::History).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("murattal-storage-{}", uuid::Uuid::new_v4()));
        {
            let storage = FileStorage::open(&dir).unwrap();
            storage.set("a", "1".to_owned()).unwrap();
            storage.set("b", "2".to_owned()).unwrap();
            storage.remove("b").unwrap();
        }

        let files: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(files, [FileStorage::FILE_NAME]);

        let storage = FileStorage::open(&dir).unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get("b").unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }
}
