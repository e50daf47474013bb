//! In memory storage.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{is_fresh, now_millis, BatchEntry, Millis, Storage};

type Entries = BTreeMap<Vec<u8>, (Bytes, Option<Millis>)>;

/// Storage that lives only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct Store {
    entries: Arc<RwLock<Entries>>,
}

impl Storage for Store {
    fn put(&self, key: &[u8], value: &[u8], expire_at: Option<Millis>) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_vec(), (Bytes::copy_from_slice(value), expire_at));
        Ok(())
    }

    fn get(&self, key: &[u8], prefix: bool, fresh_only: bool) -> Result<Option<Bytes>> {
        let entries = self.entries.read();
        let now = now_millis();
        let accept = |expire_at: &Option<Millis>| !fresh_only || is_fresh(*expire_at, now);
        if !prefix {
            return Ok(entries
                .get(key)
                .filter(|(_, expire_at)| accept(expire_at))
                .map(|(value, _)| value.clone()));
        }
        Ok(entries
            .range(key.to_vec()..)
            .take_while(|(k, _)| k.starts_with(key))
            .find(|(_, (_, expire_at))| accept(expire_at))
            .map(|(_, (value, _))| value.clone()))
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn put_batch(&self, batch: &[BatchEntry]) -> Result<()> {
        let mut entries = self.entries.write();
        for entry in batch {
            entries.insert(entry.key.clone(), (entry.value.clone(), entry.expire_at));
        }
        Ok(())
    }
}
