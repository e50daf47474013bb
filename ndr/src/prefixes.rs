//! Prefixes the repository serves reads under.
//!
//! Every registered prefix gets a responder answering interests from the [`Cache`].
//! Registrations are counted: inserts and sync groups may share a prefix, and it stays
//! served until the last holder unregisters it. The counts are persisted under
//! [`PREFIXES_KEY`] and re-registered on recovery.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use ndr_base::Name;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    cache::Cache,
    transport::{responder, Interest, Transport},
};

/// Storage key of the persisted prefix set.
pub const PREFIXES_KEY: &[u8] = b"prefixes";

/// The registry of read prefixes.
#[derive(Debug, Clone)]
pub struct ReadPrefixes<T> {
    transport: T,
    cache: Cache,
    registered: Arc<Mutex<BTreeMap<Name, u64>>>,
}

impl<T: Transport> ReadPrefixes<T> {
    /// Creates an empty registry.
    pub fn new(transport: T, cache: Cache) -> Self {
        Self {
            transport,
            cache,
            registered: Default::default(),
        }
    }

    /// Starts serving reads under `prefix`, or adds a holder if it is already served.
    ///
    /// Returns `false` if it was already served.
    pub fn register(&self, prefix: &Name) -> Result<bool> {
        let mut registered = self.registered.lock();
        let served = match registered.get_mut(prefix) {
            Some(count) => {
                *count += 1;
                false
            }
            None => {
                self.serve(prefix)?;
                registered.insert(prefix.clone(), 1);
                true
            }
        };
        self.persist(&registered)?;
        Ok(served)
    }

    /// Drops one holder of `prefix`, and stops serving it when none is left.
    ///
    /// Returns whether reads under `prefix` stopped being served.
    pub fn unregister(&self, prefix: &Name) -> Result<bool> {
        let mut registered = self.registered.lock();
        let Some(count) = registered.get_mut(prefix) else {
            return Ok(false);
        };
        *count -= 1;
        let stopped = *count == 0;
        if stopped {
            registered.remove(prefix);
            self.transport.unregister(prefix);
            debug!(%prefix, "stopped serving reads");
        }
        self.persist(&registered)?;
        Ok(stopped)
    }

    /// Whether reads under `prefix` are served.
    pub fn contains(&self, prefix: &Name) -> bool {
        self.registered.lock().contains_key(prefix)
    }

    /// All served prefixes.
    pub fn list(&self) -> Vec<Name> {
        self.registered.lock().keys().cloned().collect()
    }

    /// Re-registers the persisted prefixes. Returns how many were restored.
    pub fn recover(&self) -> Result<usize> {
        let Some(bytes) = self.cache.storage().get(PREFIXES_KEY, false, false)? else {
            return Ok(0);
        };
        let prefixes: Vec<(Name, u64)> = match postcard::from_bytes(&bytes) {
            Ok(prefixes) => prefixes,
            Err(err) => {
                warn!(?err, "discarding undecodable read prefixes");
                return Ok(0);
            }
        };
        let mut registered = self.registered.lock();
        for (prefix, count) in &prefixes {
            self.serve(prefix)?;
            registered.insert(prefix.clone(), (*count).max(1));
        }
        Ok(prefixes.len())
    }

    /// Stops serving every prefix without touching the persisted set.
    pub fn shutdown(&self) {
        for prefix in self.registered.lock().keys() {
            self.transport.unregister(prefix);
        }
    }

    fn serve(&self, prefix: &Name) -> Result<()> {
        let cache = self.cache.clone();
        self.transport
            .register(
                prefix.clone(),
                responder(move |interest: Interest| {
                    let res = cache.get(&interest.name, interest.can_be_prefix, interest.must_be_fresh);
                    async move {
                        match res {
                            Ok(data) => data,
                            Err(err) => {
                                warn!(name = %interest.name, ?err, "read failed");
                                None
                            }
                        }
                    }
                }),
            )
            .with_context(|| format!("failed to serve {prefix}"))?;
        debug!(%prefix, "serving reads");
        Ok(())
    }

    fn persist(&self, registered: &BTreeMap<Name, u64>) -> Result<()> {
        let prefixes: Vec<(&Name, u64)> = registered.iter().map(|(p, c)| (p, *c)).collect();
        let bytes = postcard::to_stdvec(&prefixes)?;
        self.cache.storage().put(PREFIXES_KEY, &bytes, None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ndr_base::Data;

    use super::*;
    use crate::{
        storage::mem,
        transport::{mem::MemNetwork, RequestError},
    };

    #[tokio::test(start_paused = true)]
    async fn register_recover_unregister() -> Result<()> {
        let net = MemNetwork::new();
        let cache = Cache::new(Arc::new(mem::Store::default()));
        let prefix: Name = "/videos".parse()?;
        let data = Data::new(prefix.append_segment(0), "frame");
        cache.put(&data);

        let prefixes = ReadPrefixes::new(net.endpoint(), cache.clone());
        assert!(prefixes.register(&prefix)?);
        assert!(!prefixes.register(&prefix)?);

        let client = net.endpoint();
        let interest = Interest::new(prefix.clone()).can_be_prefix(true);
        assert_eq!(client.express(interest.clone()).await, Ok(data.clone()));
        let missing = Interest::new(prefix.append_segment(1)).lifetime(Duration::from_millis(100));
        assert_eq!(client.express(missing).await, Err(RequestError::Timeout));

        prefixes.shutdown();
        let restored = ReadPrefixes::new(net.endpoint(), cache.clone());
        assert_eq!(restored.recover()?, 1);
        assert_eq!(restored.list(), vec![prefix.clone()]);
        assert_eq!(client.express(interest.clone()).await, Ok(data.clone()));

        // both registrations survived the restart
        assert!(!restored.unregister(&prefix)?);
        assert_eq!(client.express(interest.clone()).await, Ok(data));
        assert!(restored.unregister(&prefix)?);
        assert!(matches!(
            client.express(interest).await,
            Err(RequestError::Nack(_))
        ));
        let again = ReadPrefixes::new(net.endpoint(), cache);
        assert_eq!(again.recover()?, 0);
        Ok(())
    }
}
