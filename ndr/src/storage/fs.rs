//! On disk storage backed by redb.

use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use tracing::info;

use super::{is_fresh, now_millis, BatchEntry, Millis, Storage};

/// Table: Objects
/// Key:   `&[u8]`         # storage key
/// Value: `(&[u8], u64)`  # (value, expire_at in millis, `u64::MAX` for never)
const OBJECTS_TABLE: TableDefinition<&[u8], (&[u8], u64)> = TableDefinition::new("objects-1");

const NEVER: u64 = u64::MAX;

fn to_stored(expire_at: Option<Millis>) -> u64 {
    expire_at.unwrap_or(NEVER)
}

fn from_stored(expire_at: u64) -> Option<Millis> {
    (expire_at != NEVER).then_some(expire_at)
}

/// Storage in a single redb database.
#[derive(Debug)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Opens or creates the database file at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading repository database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory at {}", path.display())
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open repository database")?;
        Self::open(db)
    }

    /// Creates a database that is never written to disk.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(OBJECTS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db })
    }
}

impl Storage for Store {
    fn put(&self, key: &[u8], value: &[u8], expire_at: Option<Millis>) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(OBJECTS_TABLE)?;
            table.insert(key, (value, to_stored(expire_at)))?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, key: &[u8], prefix: bool, fresh_only: bool) -> Result<Option<Bytes>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(OBJECTS_TABLE)?;
        let now = now_millis();
        if !prefix {
            let Some(row) = table.get(key)? else {
                return Ok(None);
            };
            let (value, expire_at) = row.value();
            if fresh_only && !is_fresh(from_stored(expire_at), now) {
                return Ok(None);
            }
            return Ok(Some(Bytes::copy_from_slice(value)));
        }
        for row in table.range::<&[u8]>(key..)? {
            let (k, v) = row?;
            if !k.value().starts_with(key) {
                break;
            }
            let (value, expire_at) = v.value();
            if fresh_only && !is_fresh(from_stored(expire_at), now) {
                continue;
            }
            return Ok(Some(Bytes::copy_from_slice(value)));
        }
        Ok(None)
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut table = tx.open_table(OBJECTS_TABLE)?;
            let removed = table.remove(key)?.is_some();
            #[allow(clippy::let_and_return)]
            removed
        };
        tx.commit()?;
        Ok(removed)
    }

    fn put_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(OBJECTS_TABLE)?;
            for entry in entries {
                table.insert(
                    entry.key.as_slice(),
                    (entry.value.as_ref(), to_stored(entry.expire_at)),
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_in_memory() {
        crate::storage::tests::exercise(&Store::in_memory().unwrap());
    }

    #[test]
    fn survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("repo.redb");
        {
            let store = Store::persistent(&path)?;
            store.put(b"key", b"value", None)?;
        }
        let store = Store::persistent(&path)?;
        assert_eq!(store.get(b"key", false, true)?.unwrap(), "value");
        Ok(())
    }
}
