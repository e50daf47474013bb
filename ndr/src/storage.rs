//! Durable key/value storage behind the cache.
//!
//! Keys are opaque bytes. Data objects are stored under their canonical key (the name
//! encoding with the outer type and length stripped), so a prefix lookup over keys is the
//! same as a prefix lookup over names.
use std::{
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod fs;
pub mod mem;

/// Milliseconds since the unix epoch, the unit of all persisted expiry times.
pub type Millis = u64;

/// Current wall clock time in [`Millis`].
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One entry of a batched write.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Storage key.
    pub key: Vec<u8>,
    /// Stored value.
    pub value: Bytes,
    /// Absolute expiry, `None` for values that never go stale.
    pub expire_at: Option<Millis>,
}

/// A durable key/value store.
pub trait Storage: std::fmt::Debug + Send + Sync + 'static {
    /// Inserts or replaces a value.
    fn put(&self, key: &[u8], value: &[u8], expire_at: Option<Millis>) -> Result<()>;

    /// Looks up a value.
    ///
    /// With `prefix` set, returns the first value (in key order) whose key starts with `key`.
    /// With `fresh_only` set, values whose expiry has passed are skipped.
    fn get(&self, key: &[u8], prefix: bool, fresh_only: bool) -> Result<Option<Bytes>>;

    /// Removes a value, returning whether it existed.
    fn remove(&self, key: &[u8]) -> Result<bool>;

    /// Writes all entries atomically.
    fn put_batch(&self, entries: &[BatchEntry]) -> Result<()>;
}

/// Selects the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep everything in memory.
    #[default]
    Memory,
    /// Persist to a redb database file.
    Redb {
        /// Path of the database file.
        path: PathBuf,
    },
}

/// Opens the backend selected by `config`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Memory => Arc::new(mem::Store::default()),
        StorageConfig::Redb { path } => Arc::new(fs::Store::persistent(path)?),
    };
    Ok(storage)
}

fn is_fresh(expire_at: Option<Millis>, now: Millis) -> bool {
    expire_at.map_or(true, |t| t > now)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Checks the storage contract against any backend.
    pub(crate) fn exercise(store: &dyn Storage) {
        let now = now_millis();
        store.put(b"/a/1", b"one", None).unwrap();
        store.put(b"/a/2", b"two", Some(now + 60_000)).unwrap();
        store.put(b"/a/3", b"stale", Some(now - 1)).unwrap();

        assert_eq!(store.get(b"/a/1", false, false).unwrap().unwrap(), "one");
        assert_eq!(store.get(b"/a/", true, false).unwrap().unwrap(), "one");
        assert!(store.get(b"/a/", false, false).unwrap().is_none());
        assert!(store.get(b"/a/3", false, true).unwrap().is_none());
        assert_eq!(store.get(b"/a/3", false, false).unwrap().unwrap(), "stale");

        assert!(store.remove(b"/a/1").unwrap());
        assert!(!store.remove(b"/a/1").unwrap());
        assert_eq!(store.get(b"/a/", true, true).unwrap().unwrap(), "two");
        assert!(store.get(b"/b", true, false).unwrap().is_none());

        store
            .put_batch(&[
                BatchEntry {
                    key: b"/c/1".to_vec(),
                    value: Bytes::from_static(b"c1"),
                    expire_at: None,
                },
                BatchEntry {
                    key: b"/c/2".to_vec(),
                    value: Bytes::from_static(b"c2"),
                    expire_at: Some(now - 1),
                },
            ])
            .unwrap();
        assert_eq!(store.get(b"/c/2", false, false).unwrap().unwrap(), "c2");
        assert_eq!(store.get(b"/c", true, true).unwrap().unwrap(), "c1");
    }

    #[test]
    fn factory_memory() {
        let store = open(&StorageConfig::Memory).unwrap();
        exercise(&*store);
    }

    #[test]
    fn config_toml() {
        let config: StorageConfig = toml::from_str("kind = \"redb\"\npath = \"/tmp/x.redb\"").unwrap();
        assert_eq!(
            config,
            StorageConfig::Redb {
                path: "/tmp/x.redb".into()
            }
        );
    }
}
