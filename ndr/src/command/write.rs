//! Insert commands.
//!
//! Every object of the command is fetched from the network and written through the
//! cache. A segment range fetches `<name>/seg=<id>` with the concurrent fetcher; an
//! object without range is fetched by its exact name. Once an object is complete the
//! repository starts serving reads under its register prefix, or its name.

use std::time::Duration;

use futures_lite::StreamExt;
use ndr_base::Name;
use tracing::{debug, error_span, info, warn, Instrument};

use super::{
    accept, check_responder, range_len, retire, CheckRoutes, HandlerContext, ObjectParam,
    ObjectResult, Processes, Record, RepoCommand, RepoCommandResponse, RequestId, StatusCode,
};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::{
    fetch::{fetch_one, SegmentFetch},
    transport::Transport,
};
#[cfg(feature = "metrics")]
use iroh_metrics::inc;

/// Handles insert commands.
#[derive(Debug, Clone)]
pub struct WriteHandle<T> {
    ctx: HandlerContext<T>,
    processes: Processes<RepoCommandResponse>,
    check_routes: CheckRoutes<T>,
    grace: Duration,
}

impl<T: Transport> WriteHandle<T> {
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
                warn!(%reason, "malformed insert command");
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
            debug!(id = %id.fmt_short(), "insert already known");
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
                    _ = shutdown.cancelled() => debug!("insert aborted"),
                    _ = this.run(id, &command) => {}
                }
                if let Some(prefix) = &command.check_prefix {
                    this.check_routes.release(prefix);
                }
            }
            .instrument(error_span!("insert", id = %id.fmt_short())),
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
            let status = self.insert_object(id, index, object).await;
            self.processes
                .update(&id, |r| r.objects[index].status_code = status);
            completed &= status == StatusCode::Completed;
        }
        let status = if completed {
            #[cfg(feature = "metrics")]
            inc!(Metrics, inserts_completed);
            StatusCode::Completed
        } else {
            #[cfg(feature = "metrics")]
            inc!(Metrics, inserts_failed);
            StatusCode::Failed
        };
        self.processes.update(&id, |r| r.status_code = status);
        info!(%status, "insert finished");
        retire(&self.processes, id, self.grace).await;
    }

    async fn insert_object(&self, id: RequestId, index: usize, object: &ObjectParam) -> StatusCode {
        let repo = &self.ctx.repo_name;
        if object.name.is_prefix_of(repo) || repo.is_prefix_of(&object.name) {
            warn!(name = %object.name, "object overlaps the repository namespace");
            return StatusCode::Conflict;
        }
        self.processes
            .update(&id, |r| r.objects[index].status_code = StatusCode::InProgress);

        let mut options = self
            .ctx
            .fetch
            .options(object.start_block_id.unwrap_or(0), object.end_block_id);
        options.forwarding_hint = object.forwarding_hint.clone();
        options.cancel = self.ctx.shutdown.child_token();

        let complete = match object.start_block_id {
            None => match fetch_one(&self.ctx.transport, object.name.clone(), &options).await {
                Ok(data) => {
                    self.ctx.cache.put(&data);
                    self.processes.update(&id, |r| r.objects[index].insert_num = 1);
                    true
                }
                Err(err) => {
                    warn!(name = %object.name, %err, "fetch failed");
                    false
                }
            },
            Some(start) => {
                let mut fetch =
                    SegmentFetch::start(self.ctx.transport.clone(), object.name.clone(), options);
                let mut count = 0u64;
                while let Some((_, data)) = fetch.next().await {
                    self.ctx.cache.put(&data);
                    count += 1;
                    self.processes
                        .update(&id, |r| r.objects[index].insert_num = count);
                }
                let outcome = fetch.outcome().await;
                debug!(name = %object.name, count, ?outcome, "segments stored");
                match object.end_block_id {
                    Some(end) => Some(count) == range_len(start, end),
                    None => outcome.is_complete(),
                }
            }
        };
        if !complete {
            return StatusCode::Failed;
        }
        if !self.ctx.register_root {
            let prefix = read_prefix(object);
            if let Err(err) = self.ctx.prefixes.register(&prefix) {
                warn!(%prefix, ?err, "failed to serve inserted object");
            }
        }
        StatusCode::Completed
    }
}

fn read_prefix(object: &ObjectParam) -> Name {
    object
        .register_prefix
        .clone()
        .unwrap_or_else(|| object.name.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use bytes::Bytes;
    use ndr_base::{Component, Data};
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        cache::Cache,
        command::StatusQuery,
        config::FetchConfig,
        prefixes::ReadPrefixes,
        storage::mem,
        transport::{
            mem::{MemNetwork, MemTransport},
            responder, Interest,
        },
    };

    fn handle(net: &MemNetwork) -> WriteHandle<MemTransport> {
        let transport = net.endpoint();
        let cache = Cache::new(Arc::new(mem::Store::default()));
        let ctx = HandlerContext {
            prefixes: ReadPrefixes::new(transport.clone(), cache.clone()),
            transport,
            cache,
            repo_name: "/repo".parse().unwrap(),
            register_root: false,
            fetch: FetchConfig {
                lifetime: Duration::from_millis(200),
                max_retries: 2,
                ..Default::default()
            },
            shutdown: CancellationToken::new(),
        };
        WriteHandle::new(ctx, Processes::default(), Duration::from_secs(10))
    }

    fn produce(net: &MemNetwork, name: &Name, segments: u64) -> MemTransport {
        let producer = net.endpoint();
        let base = name.clone();
        producer
            .register(
                name.clone(),
                responder(move |interest: Interest| {
                    let base = base.clone();
                    async move {
                        let Some(seg) = interest.name.last().and_then(Component::as_segment) else {
                            return Some(Data::new(base, "whole"));
                        };
                        (seg < segments).then(|| {
                            Data::new(base.append_segment(seg), format!("{seg}"))
                                .with_final_block_id(Component::segment(segments - 1))
                        })
                    }
                }),
            )
            .unwrap();
        producer
    }

    async fn wait(handle: &WriteHandle<MemTransport>, id: RequestId) -> RepoCommandResponse {
        loop {
            let record = handle.processes().get(&id).unwrap();
            if record.status_code.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn command(object: ObjectParam) -> Bytes {
        RepoCommand {
            objects: vec![object],
            check_prefix: None,
        }
        .encode()
        .unwrap()
        .into()
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn insert_open_range() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/file".parse()?;
        let _producer = produce(&net, &name, 3);
        let handle = handle(&net);

        let accepted = handle.on_command(&command(ObjectParam::new(name.clone()).range(0, None)));
        assert_eq!(accepted.status_code, StatusCode::Roger);
        let id = accepted.request_no.unwrap();
        let done = wait(&handle, id).await;
        assert_eq!(done.status_code, StatusCode::Completed);
        assert_eq!(done.objects[0].insert_num, 3);
        assert!(handle.ctx.prefixes.contains(&name));
        for seg in 0..3 {
            assert!(handle
                .ctx
                .cache
                .get(&name.append_segment(seg), false, false)?
                .is_some());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn insert_single_object() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/note".parse()?;
        let _producer = produce(&net, &name, 0);
        let handle = handle(&net);
        let register: Name = "/producer".parse()?;
        let accepted = handle.on_command(&command(ObjectParam {
            register_prefix: Some(register.clone()),
            ..ObjectParam::new(name.clone())
        }));
        let done = wait(&handle, accepted.request_no.unwrap()).await;
        assert_eq!(done.status_code, StatusCode::Completed);
        assert_eq!(done.objects[0].insert_num, 1);
        assert!(handle.ctx.prefixes.contains(&register));
        assert!(!handle.ctx.prefixes.contains(&name));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn short_object_fails_explicit_range() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/short".parse()?;
        let _producer = produce(&net, &name, 2);
        let handle = handle(&net);
        let accepted = handle.on_command(&command(ObjectParam::new(name.clone()).range(0, Some(4))));
        let done = wait(&handle, accepted.request_no.unwrap()).await;
        assert_eq!(done.status_code, StatusCode::Failed);
        assert_eq!(done.objects[0].status_code, StatusCode::Failed);
        assert_eq!(done.objects[0].insert_num, 2);
        assert!(!handle.ctx.prefixes.contains(&name));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn range_up_to_max_id_finishes() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/open".parse()?;
        let _producer = produce(&net, &name, 3);
        let handle = handle(&net);
        let accepted =
            handle.on_command(&command(ObjectParam::new(name.clone()).range(0, Some(u64::MAX))));
        let done = tokio::time::timeout(Duration::from_secs(30), wait(&handle, accepted.request_no.unwrap()))
            .await?;
        // the final block ends the fetch, the declared range is not satisfied
        assert_eq!(done.status_code, StatusCode::Failed);
        assert_eq!(done.objects[0].insert_num, 3);
        for seg in 0..3 {
            assert!(handle
                .ctx
                .cache
                .get(&name.append_segment(seg), false, false)?
                .is_some());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn replay_is_idempotent() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/once".parse()?;
        let _producer = produce(&net, &name, 1);
        let handle = handle(&net);
        let payload = command(ObjectParam::new(name).range(0, Some(0)));
        let first = handle.on_command(&payload);
        let second = handle.on_command(&payload);
        assert_eq!(first.request_no, second.request_no);
        assert_eq!(handle.processes().len(), 1);
        let done = wait(&handle, first.request_no.unwrap()).await;
        assert_eq!(done.objects[0].insert_num, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_conflicting() -> Result<()> {
        let net = MemNetwork::new();
        let handle = handle(&net);
        let end_only = ObjectParam {
            end_block_id: Some(2),
            ..ObjectParam::new("/x".parse()?)
        };
        assert_eq!(handle.on_command(&command(end_only)).status_code, StatusCode::Malformed);
        assert_eq!(handle.on_command(b"garbage").status_code, StatusCode::Malformed);
        assert!(handle.processes().is_empty());

        let accepted = handle.on_command(&command(ObjectParam::new("/repo/insert".parse()?)));
        let done = wait(&handle, accepted.request_no.unwrap()).await;
        assert_eq!(done.status_code, StatusCode::Failed);
        assert_eq!(done.objects[0].status_code, StatusCode::Conflict);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_and_check_prefix() -> Result<()> {
        let net = MemNetwork::new();
        let name: Name = "/producer/checked".parse()?;
        let _producer = produce(&net, &name, 1);
        let handle = handle(&net);
        let check_prefix: Name = "/client/status".parse()?;
        let payload: Bytes = RepoCommand {
            objects: vec![ObjectParam::new(name).range(0, Some(0))],
            check_prefix: Some(check_prefix.clone()),
        }
        .encode()?
        .into();
        let id = handle.on_command(&payload).request_no.unwrap();
        wait(&handle, id).await;

        let client = net.endpoint();
        let query = postcard::to_stdvec(&StatusQuery { request_no: id })?;
        let data = client
            .express(Interest::with_params(&check_prefix, query.clone()))
            .await?;
        let record: RepoCommandResponse = postcard::from_bytes(&data.content)?;
        assert_eq!(record.status_code, StatusCode::Completed);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.processes().get(&id).is_none());
        assert!(client
            .express(Interest::with_params(&check_prefix, query))
            .await
            .is_err());
        Ok(())
    }
}
