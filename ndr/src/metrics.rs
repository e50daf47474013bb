//! Metrics for ndr

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Metrics for the repository
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub segments_fetched: Counter,
    pub segment_retries: Counter,
    pub fetches_failed: Counter,
    pub cache_flushes: Counter,
    pub cache_flushed_entries: Counter,
    pub inserts_completed: Counter,
    pub inserts_failed: Counter,
    pub deletes_completed: Counter,
    pub objects_deleted: Counter,
    pub sync_advertisements_recv: Counter,
    pub sync_advertisements_rejected: Counter,
    pub sync_retransmissions: Counter,
    pub sync_segments_stored: Counter,
    pub bulk_objects_ingested: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            segments_fetched: Counter::new("Number of segments retrieved by the fetcher"),
            segment_retries: Counter::new("Number of segment requests that were retried"),
            fetches_failed: Counter::new("Number of fetch sessions that exhausted their retries"),
            cache_flushes: Counter::new("Number of times the cache was flushed to storage"),
            cache_flushed_entries: Counter::new("Number of cache entries written to storage"),
            inserts_completed: Counter::new("Number of insert commands that completed"),
            inserts_failed: Counter::new("Number of insert commands that failed"),
            deletes_completed: Counter::new("Number of delete commands that completed"),
            objects_deleted: Counter::new("Number of objects removed by delete commands"),
            sync_advertisements_recv: Counter::new("Number of state vector advertisements received"),
            sync_advertisements_rejected: Counter::new(
                "Number of state vector advertisements rejected as malformed",
            ),
            sync_retransmissions: Counter::new("Number of buffered advertisements retransmitted"),
            sync_segments_stored: Counter::new("Number of replicated objects stored"),
            bulk_objects_ingested: Counter::new("Number of objects received by bulk ingestion"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "ndr"
    }
}
