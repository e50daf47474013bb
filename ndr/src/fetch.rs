//! Concurrent retrieval of segmented objects.
//!
//! A [`SegmentFetch`] pulls `<base>/<id>` for a range of ids with a bounded number of
//! requests outstanding. Every id is retried on its own until it succeeds or its attempt
//! budget runs out. Results are reassembled and yielded strictly in id order.
//!
//! When no end id is given the range is open and the fetch runs until a segment carrying
//! a final block marker is seen. The marker shrinks the range, and requests already sent
//! for ids past it are cancelled.
//!
//! If an id exhausts its retries the fetch stops dispatching, waits for the requests in
//! flight below the failed id, yields the contiguous run it has, and ends with
//! [`FetchOutcome::Failed`].

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::Stream;
use ndr_base::{Data, Name};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::JoinSet,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, error_span, trace, warn, Instrument};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::transport::{Interest, RequestError, Transport, DEFAULT_LIFETIME};
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// Default number of outstanding requests per fetch.
pub const DEFAULT_CONCURRENCY: usize = 10;
/// Default number of retries per id.
pub const DEFAULT_MAX_RETRIES: u32 = 15;
/// Default pause before retrying after a negative acknowledgement.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How ids are appended to the base name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Naming {
    /// Segment number components.
    #[default]
    Segment,
    /// Sequence number components.
    Sequence,
}

impl Naming {
    /// The name of item `id` under `base`.
    pub fn item_name(&self, base: &Name, id: u64) -> Name {
        match self {
            Naming::Segment => base.append_segment(id),
            Naming::Sequence => base.append_sequence(id),
        }
    }
}

/// Parameters of a fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// First id, inclusive.
    pub start: u64,
    /// Last id, inclusive. `None` fetches until a final block marker is seen.
    pub end: Option<u64>,
    /// Maximum number of outstanding requests.
    pub concurrency: usize,
    /// Retries per id after the first attempt. Zero retries forever.
    pub max_retries: u32,
    /// Lifetime of each request.
    pub lifetime: Duration,
    /// Pause before retrying after a negative acknowledgement.
    pub retry_delay: Duration,
    /// How ids are appended to the base name.
    pub naming: Naming,
    /// Forwarding hint attached to every request.
    pub forwarding_hint: Option<Name>,
    /// Cancels the whole fetch when triggered.
    pub cancel: CancellationToken,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            lifetime: DEFAULT_LIFETIME,
            retry_delay: DEFAULT_RETRY_DELAY,
            naming: Naming::Segment,
            forwarding_hint: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl FetchOptions {
    /// Options for the inclusive range `start..=end`.
    pub fn range(start: u64, end: Option<u64>) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    fn interest(&self, name: Name) -> Interest {
        Interest::new(name)
            .lifetime(self.lifetime)
            .forwarding_hint(self.forwarding_hint.clone())
    }
}

/// Failure to retrieve one item.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Every attempt failed.
    #[error("{name} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Requested name.
        name: Name,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last: RequestError,
    },
    /// The request was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// How a fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every id up to `final_id` was delivered. `final_id` is `None` for an empty range.
    Complete {
        /// Last delivered id.
        final_id: Option<u64>,
    },
    /// An id exhausted its retries after `delivered` items.
    Failed {
        /// Number of items delivered.
        delivered: u64,
    },
    /// The fetch was cancelled or the stream dropped.
    Cancelled,
}

impl FetchOutcome {
    /// Whether all items were delivered.
    pub fn is_complete(&self) -> bool {
        matches!(self, FetchOutcome::Complete { .. })
    }
}

/// A running fetch, yielding `(id, data)` in increasing id order.
#[derive(Debug)]
pub struct SegmentFetch {
    items: mpsc::Receiver<(u64, Data)>,
    outcome: oneshot::Receiver<FetchOutcome>,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl SegmentFetch {
    /// Starts fetching `base/<id>` with `transport`.
    pub fn start<T: Transport>(transport: T, base: Name, options: FetchOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        let (items_tx, items_rx) = mpsc::channel(concurrency);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = options.cancel.clone();
        let span = error_span!("fetch", base = %base, start = options.start, end = ?options.end);
        let session = Session {
            transport,
            base,
            options,
            concurrency,
            items: items_tx,
        };
        let task = tokio::spawn(
            async move {
                let outcome = session.run().await;
                debug!(?outcome, "fetch finished");
                outcome_tx.send(outcome).ok();
            }
            .instrument(span),
        );
        Self {
            items: items_rx,
            outcome: outcome_rx,
            cancel,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Cancels the fetch. Items already yielded stay valid.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the fetch to end, discarding items not yet consumed.
    pub async fn outcome(mut self) -> FetchOutcome {
        while self.items.recv().await.is_some() {}
        self.outcome.await.unwrap_or(FetchOutcome::Cancelled)
    }
}

impl Stream for SegmentFetch {
    type Item = (u64, Data);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

/// Fetches a single object by exact name.
pub async fn fetch_one<T: Transport>(
    transport: &T,
    name: Name,
    options: &FetchOptions,
) -> Result<Data, FetchError> {
    let interest = options.interest(name);
    tokio::select! {
        biased;
        _ = options.cancel.cancelled() => Err(FetchError::Cancelled),
        res = retrying(transport, interest, options.max_retries, options.retry_delay) => res,
    }
}

/// Expresses `interest` until it succeeds or `max_retries` retries failed.
async fn retrying<T: Transport>(
    transport: &T,
    interest: Interest,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<Data, FetchError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match transport.express(interest.clone()).await {
            Ok(data) => {
                #[cfg(feature = "metrics")]
                inc!(Metrics, segments_fetched);
                return Ok(data);
            }
            Err(RequestError::Cancelled) => return Err(FetchError::Cancelled),
            Err(err) => {
                if max_retries != 0 && attempts > max_retries {
                    return Err(FetchError::Exhausted {
                        name: interest.name,
                        attempts,
                        last: err,
                    });
                }
                trace!(name = %interest.name, attempts, %err, "retrying");
                #[cfg(feature = "metrics")]
                inc!(Metrics, segment_retries);
                if let RequestError::Nack(_) = err {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

#[derive(Debug)]
struct Session<T> {
    transport: T,
    base: Name,
    options: FetchOptions,
    concurrency: usize,
    items: mpsc::Sender<(u64, Data)>,
}

impl<T: Transport> Session<T> {
    async fn run(self) -> FetchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(u64, Result<Data, FetchError>)> = JoinSet::new();
        // cancel handles of the tasks in flight, by id
        let mut in_flight: BTreeMap<u64, CancellationToken> = BTreeMap::new();
        let mut buffer: BTreeMap<u64, Data> = BTreeMap::new();
        let mut next_to_dispatch = self.options.start;
        let mut next_to_deliver = self.options.start;
        let mut final_id = self.options.end;
        let mut final_seen = false;
        let mut failed = false;

        loop {
            if final_id.is_some_and(|f| next_to_deliver > f) {
                return FetchOutcome::Complete {
                    final_id: final_id.filter(|f| *f >= self.options.start),
                };
            }
            let can_dispatch = !failed && final_id.map_or(true, |f| next_to_dispatch <= f);
            if !can_dispatch && tasks.is_empty() {
                #[cfg(feature = "metrics")]
                inc!(Metrics, fetches_failed);
                return FetchOutcome::Failed {
                    delivered: next_to_deliver - self.options.start,
                };
            }

            tokio::select! {
                biased;
                _ = self.options.cancel.cancelled() => {
                    debug!("fetch cancelled");
                    return FetchOutcome::Cancelled;
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    let (id, res) = match res {
                        Ok(res) => res,
                        Err(err) => {
                            warn!(?err, "fetch task panicked");
                            failed = true;
                            continue;
                        }
                    };
                    in_flight.remove(&id);
                    match res {
                        Ok(data) => {
                            if final_id.is_some_and(|f| id > f) {
                                trace!(id, "discarding item past the final block");
                                continue;
                            }
                            if !final_seen {
                                if let Some(marker) = data.final_block_number() {
                                    final_seen = true;
                                    if final_id.map_or(true, |f| marker < f) {
                                        debug!(id, marker, "final block discovered");
                                        final_id = Some(marker);
                                        for (_, token) in in_flight.range(marker.saturating_add(1)..) {
                                            token.cancel();
                                        }
                                        if id > marker {
                                            continue;
                                        }
                                    }
                                }
                            }
                            buffer.insert(id, data);
                            while let Some(data) = buffer.remove(&next_to_deliver) {
                                if self.items.send((next_to_deliver, data)).await.is_err() {
                                    debug!("fetch receiver dropped");
                                    return FetchOutcome::Cancelled;
                                }
                                next_to_deliver += 1;
                            }
                        }
                        Err(FetchError::Cancelled) => trace!(id, "request cancelled"),
                        Err(err) => {
                            warn!(id, %err, "giving up");
                            failed = true;
                            // nothing past a gap can be delivered
                            for (_, token) in in_flight.range(id.saturating_add(1)..) {
                                token.cancel();
                            }
                        }
                    }
                }
                permit = semaphore.clone().acquire_owned(), if can_dispatch => {
                    let Ok(permit) = permit else {
                        return FetchOutcome::Cancelled;
                    };
                    let id = next_to_dispatch;
                    next_to_dispatch += 1;
                    let token = self.options.cancel.child_token();
                    in_flight.insert(id, token.clone());
                    let transport = self.transport.clone();
                    let interest = self
                        .options
                        .interest(self.options.naming.item_name(&self.base, id));
                    let max_retries = self.options.max_retries;
                    let retry_delay = self.options.retry_delay;
                    trace!(id, "dispatch");
                    tasks.spawn(async move {
                        let res = tokio::select! {
                            biased;
                            _ = token.cancelled() => Err(FetchError::Cancelled),
                            res = retrying(&transport, interest, max_retries, retry_delay) => res,
                        };
                        drop(permit);
                        (id, res)
                    });
                }
            }
        }
    }
}
