//! Runtime of one joined sync group.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use futures_lite::StreamExt;
use ndr_base::{Data, Name};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use super::state::{advertisement, GroupState, SvsCore};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::{
    cache::Cache,
    config::FetchConfig,
    fetch::{FetchOutcome, Naming, SegmentFetch},
    transport::{responder, Interest, Transport},
};
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// Storage key of the persisted state of the group `sync_prefix`.
pub fn state_key(sync_prefix: &Name) -> Vec<u8> {
    format!("sync_states/{sync_prefix}").into_bytes()
}

/// A joined sync group.
#[derive(Debug, Clone)]
pub struct SyncGroup<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    prefix: Name,
    transport: T,
    cache: Cache,
    fetch: FetchConfig,
    shared: Mutex<Shared>,
}

#[derive(Debug)]
struct Shared {
    core: SvsCore,
    /// Cancels the fetches of the current generation.
    cancel: CancellationToken,
    /// Nodes with a fetch task running.
    fetching: HashSet<Name>,
}

impl<T: Transport> SyncGroup<T> {
    pub(super) fn new(
        state: GroupState,
        transport: T,
        cache: Cache,
        fetch: FetchConfig,
        dedupe_window: Duration,
    ) -> Self {
        let prefix = state.sync_prefix.clone();
        Self {
            inner: Arc::new(Inner {
                prefix,
                transport,
                cache,
                fetch,
                shared: Mutex::new(Shared {
                    core: SvsCore::new(state, dedupe_window),
                    cancel: CancellationToken::new(),
                    fetching: HashSet::new(),
                }),
            }),
        }
    }

    /// The sync prefix.
    pub fn prefix(&self) -> &Name {
        &self.inner.prefix
    }

    /// A snapshot of the group state.
    pub fn state(&self) -> GroupState {
        self.inner.shared.lock().core.state().clone()
    }

    /// Starts receiving advertisements.
    pub(super) fn listen(&self) -> Result<()> {
        let group = self.clone();
        self.inner.transport.register(
            self.inner.prefix.clone(),
            responder(move |interest: Interest| {
                group.on_advertisement(&interest);
                async { None }
            }),
        )
    }

    /// Stops receiving advertisements and cancels all fetches.
    pub(super) fn stop(&self) {
        self.inner.transport.unregister(&self.inner.prefix);
        let mut shared = self.inner.shared.lock();
        shared.cancel.cancel();
        shared.fetching.clear();
    }

    /// Cancels all fetches and rebuilds the known vector from what is stored.
    pub(super) fn reset(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            shared.cancel.cancel();
            shared.cancel = CancellationToken::new();
            shared.fetching.clear();
            shared.core.reset();
        }
        debug!(group = %self.inner.prefix, "reset");
        self.persist()
    }

    /// Writes the group state to storage.
    pub(super) fn persist(&self) -> Result<()> {
        let bytes = postcard::to_stdvec(self.inner.shared.lock().core.state())?;
        self.inner
            .cache
            .storage()
            .put(&state_key(&self.inner.prefix), &bytes, None)
    }

    fn on_advertisement(&self, interest: &Interest) {
        #[cfg(feature = "metrics")]
        inc!(Metrics, sync_advertisements_recv);
        let params = match &interest.app_params {
            Some(params) if interest.has_valid_params_digest() => params,
            _ => {
                #[cfg(feature = "metrics")]
                inc!(Metrics, sync_advertisements_rejected);
                warn!(group = %self.inner.prefix, name = %interest.name, "rejecting advertisement without valid parameters");
                return;
            }
        };
        let res = self
            .inner
            .shared
            .lock()
            .core
            .on_advertisement(params, Instant::now());
        let round = match res {
            Ok(Some(round)) => round,
            Ok(None) => {
                trace!(group = %self.inner.prefix, "duplicate advertisement");
                return;
            }
            Err(err) => {
                #[cfg(feature = "metrics")]
                inc!(Metrics, sync_advertisements_rejected);
                warn!(group = %self.inner.prefix, ?err, "rejecting undecodable advertisement");
                return;
            }
        };
        for ad in round.retransmit {
            #[cfg(feature = "metrics")]
            inc!(Metrics, sync_retransmissions);
            self.inner
                .transport
                .multicast(advertisement(&self.inner.prefix, ad));
        }
        if round.advanced {
            if let Err(err) = self.persist() {
                warn!(group = %self.inner.prefix, ?err, "failed to persist sync state");
            }
            self.schedule_fetches();
        }
    }

    /// Starts a fetch task for every node that is behind and has none running.
    pub(super) fn schedule_fetches(&self) {
        let mut shared = self.inner.shared.lock();
        let cancel = shared.cancel.clone();
        let missing = shared.core.missing();
        for (node, first, last) in missing {
            if !shared.fetching.insert(node.clone()) {
                continue;
            }
            debug!(group = %self.inner.prefix, %node, first, last, "fetching missing data");
            let span = error_span!("sync_fetch", group = %self.inner.prefix, %node);
            tokio::spawn(self.clone().fetch_node(node, cancel.clone()).instrument(span));
        }
    }

    async fn fetch_node(self, node: Name, cancel: CancellationToken) {
        let base = node.join(&self.inner.prefix);
        loop {
            let (first, last) = {
                let mut shared = self.inner.shared.lock();
                if cancel.is_cancelled() {
                    return;
                }
                match shared.core.missing_for(&node) {
                    Some(range) => range,
                    None => {
                        shared.fetching.remove(&node);
                        return;
                    }
                }
            };
            let mut options = self.inner.fetch.options(first, Some(last));
            options.naming = Naming::Sequence;
            options.cancel = cancel.child_token();
            let mut fetch = SegmentFetch::start(self.inner.transport.clone(), base.clone(), options);
            while let Some((seq, data)) = fetch.next().await {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(err) = self.store(&data, &cancel).await {
                    warn!(seq, ?err, "failed to store pointed-to object");
                }
                {
                    let mut shared = self.inner.shared.lock();
                    if cancel.is_cancelled() {
                        return;
                    }
                    shared.core.record_progress(&node, seq);
                }
                if let Err(err) = self.persist() {
                    warn!(?err, "failed to persist sync state");
                }
            }
            match fetch.outcome().await {
                FetchOutcome::Complete { .. } => continue,
                FetchOutcome::Cancelled => return,
                FetchOutcome::Failed { delivered } => {
                    warn!(first, last, delivered, "fetch of missing data failed");
                    let mut shared = self.inner.shared.lock();
                    if !cancel.is_cancelled() {
                        shared.fetching.remove(&node);
                    }
                    return;
                }
            }
        }
    }

    /// Stores a replicated object, following it when its content is a name.
    async fn store(&self, data: &Data, cancel: &CancellationToken) -> Result<()> {
        self.inner.cache.put(data);
        #[cfg(feature = "metrics")]
        inc!(Metrics, sync_segments_stored);
        let pointer = match Name::decode(&data.content) {
            Ok(pointer) if !pointer.is_empty() => pointer,
            _ => return Ok(()),
        };
        let dedupe = self.inner.shared.lock().core.state().data_name_dedupe;
        if dedupe && self.inner.cache.get(&pointer, true, false)?.is_some() {
            trace!(%pointer, "pointed-to object already stored");
            return Ok(());
        }
        let mut options = self.inner.fetch.options(0, None);
        options.cancel = cancel.child_token();
        let mut fetch = SegmentFetch::start(self.inner.transport.clone(), pointer.clone(), options);
        let mut count = 0u64;
        while let Some((_, segment)) = fetch.next().await {
            self.inner.cache.put(&segment);
            count += 1;
        }
        match fetch.outcome().await {
            FetchOutcome::Complete { .. } => {
                debug!(%pointer, count, "pointed-to object stored");
                Ok(())
            }
            outcome => bail!("{pointer}: {outcome:?} after {count} segments"),
        }
    }
}
