//! Client side helpers: producing segmented objects and commanding a repository.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ndr_base::{Component, Data, Name};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    command::{
        Operation, Record, RepoCommand, RepoCommandResponse, RequestId, StatusCode, StatusQuery,
        SyncCommand, SyncCommandResponse,
    },
    pubsub::PubSub,
    transport::{responder, Interest, Transport},
};

/// Splits `content` into segments of at most `segment_size` bytes named
/// `<name>/seg=<i>`.
///
/// Every segment carries the final block id. Empty content yields one empty segment.
pub fn segment_object(
    name: &Name,
    content: impl Into<Bytes>,
    segment_size: usize,
    freshness: Duration,
) -> Vec<Data> {
    let content = content.into();
    let segment_size = segment_size.max(1);
    let count = content.len().div_ceil(segment_size).max(1) as u64;
    let last = Component::segment(count - 1);
    (0..count)
        .map(|i| {
            let start = (i as usize * segment_size).min(content.len());
            let end = (start + segment_size).min(content.len());
            Data::new(name.append_segment(i), content.slice(start..end))
                .with_freshness(freshness)
                .with_final_block_id(last.clone())
        })
        .collect()
}

/// Serves data objects under a prefix from memory.
#[derive(Debug, Clone)]
pub struct Producer<T> {
    transport: T,
    prefix: Name,
    objects: Arc<Mutex<BTreeMap<Name, Data>>>,
}

impl<T: Transport> Producer<T> {
    /// Starts answering interests under `prefix`.
    pub fn serve(transport: T, prefix: Name) -> Result<Self> {
        let objects: Arc<Mutex<BTreeMap<Name, Data>>> = Default::default();
        let store = objects.clone();
        transport.register(
            prefix.clone(),
            responder(move |interest: Interest| {
                let data = lookup(&store.lock(), &interest);
                async move { data }
            }),
        )?;
        Ok(Self {
            transport,
            prefix,
            objects,
        })
    }

    /// Adds objects to serve.
    pub fn publish(&self, objects: impl IntoIterator<Item = Data>) {
        let mut served = self.objects.lock();
        for data in objects {
            trace!(name = %data.name, "publishing");
            served.insert(data.name.clone(), data);
        }
    }

    /// Stops serving.
    pub fn stop(&self) {
        self.transport.unregister(&self.prefix);
    }
}

fn lookup(objects: &BTreeMap<Name, Data>, interest: &Interest) -> Option<Data> {
    if interest.can_be_prefix {
        objects
            .range(interest.name.clone()..)
            .next()
            .filter(|(name, _)| interest.name.is_prefix_of(name))
            .map(|(_, data)| data.clone())
    } else {
        objects.get(&interest.name).cloned()
    }
}

/// Sends commands to a repository and polls their status.
#[derive(Debug, Clone)]
pub struct RepoClient<T> {
    transport: T,
    pubsub: PubSub<T>,
    repo: Name,
}

impl<T: Transport> RepoClient<T> {
    /// A client publishing under `prefix` to the repository named `repo`.
    pub fn new(transport: T, prefix: Name, repo: Name) -> Self {
        Self {
            pubsub: PubSub::new(transport.clone(), prefix),
            transport,
            repo,
        }
    }

    /// Submits an insert command.
    pub async fn insert(&self, command: &RepoCommand) -> Result<RequestId> {
        self.submit(Operation::Insert, command.encode()?).await
    }

    /// Submits a delete command.
    pub async fn delete(&self, command: &RepoCommand) -> Result<RequestId> {
        self.submit(Operation::Delete, command.encode()?).await
    }

    /// Submits a sync join command.
    pub async fn join(&self, command: &SyncCommand) -> Result<RequestId> {
        self.submit(Operation::SyncJoin, command.encode()?).await
    }

    /// Submits a sync leave command.
    pub async fn leave(&self, command: &SyncCommand) -> Result<RequestId> {
        self.submit(Operation::SyncLeave, command.encode()?).await
    }

    async fn submit(&self, op: Operation, payload: Vec<u8>) -> Result<RequestId> {
        let id = RequestId::of(&payload);
        if !self.pubsub.publish(&op.topic(&self.repo), payload).await? {
            bail!("{op} command not acknowledged by {}", self.repo);
        }
        debug!(%op, id = %id.fmt_short(), "command submitted");
        Ok(id)
    }

    /// Queries the status of an insert or delete command.
    pub async fn check(&self, op: Operation, id: RequestId) -> Result<RepoCommandResponse> {
        self.query(op, id).await
    }

    /// Queries the status of a sync command.
    pub async fn check_sync(&self, op: Operation, id: RequestId) -> Result<SyncCommandResponse> {
        self.query(op, id).await
    }

    async fn query<R: Record>(&self, op: Operation, id: RequestId) -> Result<R> {
        let params = postcard::to_stdvec(&StatusQuery { request_no: id })?;
        let interest = Interest::with_params(&op.check_route(&self.repo), params);
        let data = self
            .transport
            .express(interest)
            .await
            .with_context(|| format!("{op} status check failed"))?;
        Ok(postcard::from_bytes(&data.content)?)
    }

    /// Polls every `interval` until the command finished, giving up after `timeout`.
    ///
    /// A command not known yet is polled again: the repository may not have fetched it.
    pub async fn wait_until_done<R: Record>(
        &self,
        op: Operation,
        id: RequestId,
        interval: Duration,
        timeout: Duration,
    ) -> Result<R> {
        let poll = async {
            loop {
                let record: R = self.query(op, id).await?;
                match record.status() {
                    StatusCode::Roger | StatusCode::InProgress | StatusCode::NotFound => {
                        trace!(%op, status = %record.status(), "not done");
                        tokio::time::sleep(interval).await;
                    }
                    _ => return anyhow::Ok(record),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .with_context(|| format!("{op} command {} did not finish", id.fmt_short()))?
    }
}
