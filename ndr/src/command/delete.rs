//! Delete commands.
//!
//! Objects are removed from the cache and the storage one segment at a time. Without
//! an end id, removal stops at the first segment that does not exist. With one, the scan
//! ends early once nothing is left under the object name.

use std::time::Duration;

use anyhow::Result;
use ndr_base::Name;
use tracing::{debug, error_span, info, trace, warn, Instrument};

use super::{
    accept, check_responder, range_len, retire, CheckRoutes, HandlerContext, ObjectParam,
    ObjectResult, Processes, Record, RepoCommand, RepoCommandResponse, RequestId, StatusCode,
};
use crate::{cache::Cache, transport::Transport};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use iroh_metrics::{inc, inc_by};

/// Segments removed between two yields to the scheduler.
const YIELD_EVERY: u64 = 64;

/// Handles delete commands.
#[derive(Debug, Clone)]
pub struct DeleteHandle<T> {
    ctx: HandlerContext<T>,
    processes: Processes<RepoCommandResponse>,
    check_routes: CheckRoutes<T>,
    grace: Duration,
}

impl<T: Transport> DeleteHandle<T> {
    /// Creates a handler keeping its records in `processes` for `grace` after they finished.
    pub fn new(
        ctx: HandlerContext<T>,
        processes: Processes<RepoCommandResponse>,
        grace: Duration,
    ) -> Self {
        let check_routes = CheckRoutes::new(ctx.transport.clone());
        Self {
            ctx,
            processes,
            check_routes,
            grace,
        }
    }

    /// The process records.
    pub fn processes(&self) -> &Processes<RepoCommandResponse> {
        &self.processes
    }

    /// Accepts an encoded [`RepoCommand`] and starts processing it in the background.
    pub fn on_command(&self, payload: &[u8]) -> RepoCommandResponse {
        let (id, command) = match accept::<RepoCommand>(payload, RepoCommand::validate) {
            Ok(accepted) => accepted,
            Err(reason) => {
                warn!(%reason, "malformed delete command");
                return RepoCommandResponse::bare(None, StatusCode::Malformed);
            }
        };
        let record = RepoCommandResponse {
            request_no: Some(id),
            status_code: StatusCode::Roger,
            objects: command
                .objects
                .iter()
                .map(|o| ObjectResult::new(o.name.clone()))
                .collect(),
        };
        if let Some(existing) = self.processes.admit(id, record.clone()) {
            debug!(id = %id.fmt_short(), "delete already known");
            return existing;
        }
        if let Some(prefix) = &command.check_prefix {
            if let Err(err) = self
                .check_routes
                .acquire(prefix, check_responder(&self.processes))
            {
                warn!(%prefix, ?err, "failed to serve check prefix");
            }
        }

        let this = self.clone();
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => debug!("delete aborted"),
                    _ = this.run(id, &command) => {}
                }
                if let Some(prefix) = &command.check_prefix {
                    this.check_routes.release(prefix);
                }
            }
            .instrument(error_span!("delete", id = %id.fmt_short())),
        );
        record
    }

    /// Stops answering checks under additional check prefixes.
    pub fn shutdown(&self) {
        self.check_routes.clear();
    }

    async fn run(&self, id: RequestId, command: &RepoCommand) {
        self.processes
            .update(&id, |r| r.status_code = StatusCode::InProgress);
        let mut completed = true;
        for (index, object) in command.objects.iter().enumerate() {
            let (status, removed) = match delete_object(&self.ctx.cache, object).await {
                Ok(res) => res,
                Err(err) => {
                    warn!(name = %object.name, ?err, "delete failed");
                    (StatusCode::Failed, 0)
                }
            };
            debug!(name = %object.name, removed, %status, "object deleted");
            #[cfg(feature = "metrics")]
            inc_by!(Metrics, objects_deleted, removed);
            self.processes.update(&id, |r| {
                r.objects[index].status_code = status;
                r.objects[index].delete_num = removed;
            });
            completed &= status == StatusCode::Completed;
            tokio::task::yield_now().await;
        }
        let status = if completed {
            #[cfg(feature = "metrics")]
            inc!(Metrics, deletes_completed);
            StatusCode::Completed
        } else {
            StatusCode::Failed
        };
        self.processes.update(&id, |r| r.status_code = status);
        info!(%status, "delete finished");
        retire(&self.processes, id, self.grace).await;
    }
}

/// Removes the segments of `object`, returning the object status and the number of
/// removed segments.
async fn delete_object(cache: &Cache, object: &ObjectParam) -> Result<(StatusCode, u64)> {
    let segment = |id: u64| -> Name { object.name.append_segment(id) };
    match (object.start_block_id, object.end_block_id) {
        (None, _) => Ok(match cache.remove(&object.name)? {
            true => (StatusCode::Completed, 1),
            false => (StatusCode::NotFound, 0),
        }),
        (Some(start), None) => {
            let mut removed = 0;
            let mut next = Some(start);
            // segments are contiguous, the first gap ends the object
            while let Some(id) = next {
                if !cache.remove(&segment(id))? {
                    break;
                }
                removed += 1;
                next = id.checked_add(1);
                if removed % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok((StatusCode::Completed, removed))
        }
        (Some(start), Some(end)) => {
            let mut removed = 0;
            let mut scanned = 0u64;
            for id in start..=end {
                if cache.remove(&segment(id))? {
                    removed += 1;
                }
                scanned += 1;
                if scanned % YIELD_EVERY == 0 {
                    if cache.get(&object.name, true, false)?.is_none() {
                        trace!(name = %object.name, id, "nothing left to delete");
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            let status = match Some(removed) == range_len(start, end) {
                true => StatusCode::Completed,
                false => StatusCode::Failed,
            };
            Ok((status, removed))
        }
    }
}
