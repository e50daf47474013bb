//! Name-indexed write-back cache in front of the durable [`Storage`].
//!
//! Writes land in an in-memory index ordered by name. A periodic flush moves the whole
//! index into the storage in a single batch and empties it. Reads consult the index
//! first and fall back to the storage on a miss, so an object is always reachable from
//! exactly one of the two once `put` returns.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use ndr_base::{Data, Name};
use parking_lot::Mutex;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::storage::{now_millis, BatchEntry, Millis, Storage};
#[cfg(feature = "metrics")]
use iroh_metrics::inc_by;

/// Default interval between two flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Entry {
    encoded: Bytes,
    expire_at: Millis,
}

impl Entry {
    fn satisfies(&self, must_be_fresh: bool, now: Millis) -> bool {
        !must_be_fresh || self.expire_at > now
    }
}

/// The write-back cache.
#[derive(Debug, Clone)]
pub struct Cache {
    index: Arc<Mutex<BTreeMap<Name, Entry>>>,
    storage: Arc<dyn Storage>,
}

impl Cache {
    /// Creates an empty cache in front of `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            index: Default::default(),
            storage,
        }
    }

    /// The storage behind this cache.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Number of objects waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.index.lock().len()
    }

    /// Stores `data`. It expires `data.freshness` from now.
    pub fn put(&self, data: &Data) {
        let expire_at = now_millis().saturating_add(data.freshness.as_millis() as u64);
        trace!(name = %data.name, expire_at, "cache put");
        self.index.lock().insert(
            data.name.clone(),
            Entry {
                encoded: data.encode(),
                expire_at,
            },
        );
    }

    /// Looks up an object by exact name, or the first object under `name` when
    /// `can_be_prefix` is set. With `must_be_fresh`, expired objects are skipped.
    pub fn get(&self, name: &Name, can_be_prefix: bool, must_be_fresh: bool) -> Result<Option<Data>> {
        let now = now_millis();
        let hit = {
            let index = self.index.lock();
            if can_be_prefix {
                index
                    .range(name.clone()..)
                    .take_while(|(k, _)| name.is_prefix_of(k))
                    .find(|(_, e)| e.satisfies(must_be_fresh, now))
                    .map(|(_, e)| e.encoded.clone())
            } else {
                index
                    .get(name)
                    .filter(|e| e.satisfies(must_be_fresh, now))
                    .map(|e| e.encoded.clone())
            }
        };
        let encoded = match hit {
            Some(encoded) => encoded,
            None => {
                let key = name.encode_components();
                match self.storage.get(&key, can_be_prefix, must_be_fresh)? {
                    Some(encoded) => encoded,
                    None => return Ok(None),
                }
            }
        };
        let data = Data::decode(&encoded).with_context(|| format!("corrupt object under {name}"))?;
        Ok(Some(data))
    }

    /// Removes the object stored under exactly `name` from the index and the storage.
    ///
    /// Returns whether it was present in either.
    pub fn remove(&self, name: &Name) -> Result<bool> {
        let cached = self.index.lock().remove(name).is_some();
        let stored = self.storage.remove(&name.encode_components())?;
        Ok(cached || stored)
    }

    /// Writes every cached object to the storage and empties the index.
    ///
    /// Returns the number of flushed objects. On error the index is left untouched.
    pub fn flush(&self) -> Result<usize> {
        // the lock is held across the write so readers never miss an object in transit
        let mut index = self.index.lock();
        if index.is_empty() {
            return Ok(0);
        }
        let batch: Vec<_> = index
            .iter()
            .map(|(name, entry)| BatchEntry {
                key: name.encode_components(),
                value: entry.encoded.clone(),
                expire_at: Some(entry.expire_at),
            })
            .collect();
        self.storage.put_batch(&batch)?;
        index.clear();
        debug!(count = batch.len(), "cache flushed");
        #[cfg(feature = "metrics")]
        {
            inc_by!(Metrics, cache_flushes, 1);
            inc_by!(Metrics, cache_flushed_entries, batch.len() as u64);
        }
        Ok(batch.len())
    }

    /// Spawns the periodic flush. It stops when the returned handle is dropped.
    ///
    /// Each flush runs on the blocking thread pool.
    pub fn spawn_flusher(&self, interval: Duration) -> AbortOnDropHandle<()> {
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let flushing = cache.clone();
                // storage writes block, run them on the blocking pool
                match tokio::task::spawn_blocking(move || flushing.flush()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(?err, "failed to flush cache"),
                    Err(err) => warn!(?err, "flush task failed"),
                }
            }
        });
        AbortOnDropHandle::new(task)
    }
}
