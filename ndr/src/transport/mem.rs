//! In-process forwarder.
//!
//! Every [`MemTransport`] created from the same [`MemNetwork`] is a separate endpoint.
//! Interests are forwarded by longest prefix match over the prefixes registered by all
//! endpoints. Responders are asked in order of decreasing prefix length and the first
//! matching data wins. If nobody produces data the request times out when its lifetime
//! elapses, like it would on a real network.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;
use ndr_base::{Data, Name};
use parking_lot::Mutex;
use tracing::trace;

use super::{Interest, NackReason, RequestError, Responder, Transport};

#[derive(derive_more::Debug)]
struct Route {
    prefix: Name,
    endpoint: u64,
    #[debug("Responder")]
    responder: Responder,
}

/// A shared in-memory network.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    routes: Arc<Mutex<Vec<Route>>>,
    next_endpoint: Arc<AtomicU64>,
}

impl MemNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new endpoint.
    pub fn endpoint(&self) -> MemTransport {
        MemTransport {
            network: self.clone(),
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Responders under `name`, longest prefix first, optionally skipping one endpoint.
    fn lookup(&self, name: &Name, skip: Option<u64>) -> Vec<Responder> {
        let routes = self.routes.lock();
        let mut matching: Vec<_> = routes
            .iter()
            .filter(|r| Some(r.endpoint) != skip && r.prefix.is_prefix_of(name))
            .collect();
        matching.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        matching.into_iter().map(|r| r.responder.clone()).collect()
    }
}

/// One endpoint on a [`MemNetwork`].
#[derive(Debug, Clone)]
pub struct MemTransport {
    network: MemNetwork,
    id: u64,
}

impl MemTransport {
    /// Identifier of this endpoint on its network.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Transport for MemTransport {
    async fn express(&self, interest: Interest) -> Result<Data, RequestError> {
        let responders = self.network.lookup(&interest.name, None);
        if responders.is_empty() {
            trace!(name = %interest.name, "no route");
            return Err(RequestError::Nack(NackReason::NoRoute));
        }
        let deadline = tokio::time::Instant::now() + interest.lifetime;
        let lookup = async {
            for responder in responders {
                if let Some(data) = responder(interest.clone()).await {
                    if interest.matches(&data) {
                        return Some(data);
                    }
                }
            }
            None
        };
        match tokio::time::timeout_at(deadline, lookup).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => {
                tokio::time::sleep_until(deadline).await;
                Err(RequestError::Timeout)
            }
            Err(_elapsed) => Err(RequestError::Timeout),
        }
    }

    fn multicast(&self, interest: Interest) {
        // never loop back to the sending endpoint
        for responder in self.network.lookup(&interest.name, Some(self.id)) {
            let interest = interest.clone();
            tokio::spawn(async move {
                responder(interest).await;
            });
        }
    }

    fn register(&self, prefix: Name, responder: Responder) -> Result<()> {
        let mut routes = self.network.routes.lock();
        routes.retain(|r| !(r.endpoint == self.id && r.prefix == prefix));
        routes.push(Route {
            prefix,
            endpoint: self.id,
            responder,
        });
        Ok(())
    }

    fn unregister(&self, prefix: &Name) -> bool {
        let mut routes = self.network.routes.lock();
        let before = routes.len();
        routes.retain(|r| !(r.endpoint == self.id && &r.prefix == prefix));
        routes.len() != before
    }
}
