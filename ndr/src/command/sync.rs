//! Sync join and leave commands.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, warn, Instrument};

use super::{
    accept, retire, Processes, Record, RequestId, StatusCode, SyncCommand, SyncCommandResponse,
    SyncParam, SyncStatus,
};
use crate::{
    sync::{JoinOutcome, SyncEngine},
    transport::Transport,
};

#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum Kind {
    Join,
    Leave,
}

/// Handles sync join and leave commands.
#[derive(Debug, Clone)]
pub struct SyncHandle<T> {
    engine: SyncEngine<T>,
    join: Processes<SyncCommandResponse>,
    leave: Processes<SyncCommandResponse>,
    grace: Duration,
    shutdown: CancellationToken,
}

impl<T: Transport> SyncHandle<T> {
    /// Creates a handler operating on `engine`.
    pub fn new(engine: SyncEngine<T>, grace: Duration, shutdown: CancellationToken) -> Self {
        Self {
            engine,
            join: Default::default(),
            leave: Default::default(),
            grace,
            shutdown,
        }
    }

    /// The engine commands are applied to.
    pub fn engine(&self) -> &SyncEngine<T> {
        &self.engine
    }

    /// Records of join commands.
    pub fn join_processes(&self) -> &Processes<SyncCommandResponse> {
        &self.join
    }

    /// Records of leave commands.
    pub fn leave_processes(&self) -> &Processes<SyncCommandResponse> {
        &self.leave
    }

    /// Accepts an encoded join [`SyncCommand`].
    pub fn on_join(&self, payload: &[u8]) -> SyncCommandResponse {
        self.on_command(Kind::Join, payload)
    }

    /// Accepts an encoded leave [`SyncCommand`].
    pub fn on_leave(&self, payload: &[u8]) -> SyncCommandResponse {
        self.on_command(Kind::Leave, payload)
    }

    fn processes(&self, kind: Kind) -> &Processes<SyncCommandResponse> {
        match kind {
            Kind::Join => &self.join,
            Kind::Leave => &self.leave,
        }
    }

    fn on_command(&self, kind: Kind, payload: &[u8]) -> SyncCommandResponse {
        let (id, command) = match accept::<SyncCommand>(payload, SyncCommand::validate) {
            Ok(accepted) => accepted,
            Err(reason) => {
                warn!(%kind, %reason, "malformed sync command");
                return SyncCommandResponse::bare(None, StatusCode::Malformed);
            }
        };
        let record = SyncCommandResponse {
            request_no: Some(id),
            status_code: StatusCode::Roger,
            sync_groups: command
                .sync_groups
                .iter()
                .map(|g| SyncStatus {
                    sync_prefix: g.sync_prefix.clone(),
                    status_code: StatusCode::Roger,
                })
                .collect(),
        };
        if let Some(existing) = self.processes(kind).admit(id, record.clone()) {
            debug!(%kind, id = %id.fmt_short(), "sync command already known");
            return existing;
        }
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => debug!("sync command aborted"),
                    _ = this.run(kind, id, &command) => {}
                }
            }
            .instrument(error_span!("sync", %kind, id = %id.fmt_short())),
        );
        record
    }

    async fn run(&self, kind: Kind, id: RequestId, command: &SyncCommand) {
        let processes = self.processes(kind);
        processes.update(&id, |r| r.status_code = StatusCode::InProgress);
        let mut completed = true;
        for (index, group) in command.sync_groups.iter().enumerate() {
            let status = match kind {
                Kind::Join => self.join_group(group),
                Kind::Leave => self.leave_group(group),
            };
            processes.update(&id, |r| r.sync_groups[index].status_code = status);
            completed &= status == StatusCode::Completed;
            tokio::task::yield_now().await;
        }
        let status = match completed {
            true => StatusCode::Completed,
            false => StatusCode::Failed,
        };
        processes.update(&id, |r| r.status_code = status);
        info!(%status, "sync command finished");
        retire(processes, id, self.grace).await;
    }

    fn join_group(&self, group: &SyncParam) -> StatusCode {
        match self.engine.join(group) {
            Ok(outcome) => {
                if outcome == JoinOutcome::AlreadyJoined {
                    debug!(group = %group.sync_prefix, "already joined");
                }
                StatusCode::Completed
            }
            Err(err) => {
                warn!(group = %group.sync_prefix, ?err, "join failed");
                StatusCode::Failed
            }
        }
    }

    fn leave_group(&self, group: &SyncParam) -> StatusCode {
        match self.engine.leave(&group.sync_prefix) {
            Ok(true) => StatusCode::Completed,
            Ok(false) => StatusCode::NotFound,
            Err(err) => {
                warn!(group = %group.sync_prefix, ?err, "leave failed");
                StatusCode::Failed
            }
        }
    }
}
