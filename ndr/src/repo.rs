//! The repository: storage, handlers and routes wired together.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use ndr_base::Name;
use strum::IntoEnumIterator;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    command::{
        check_responder, DeleteHandle, HandlerContext, Operation, Processes, RepoCommand,
        RepoCommandResponse, SyncCommand, SyncCommandResponse, SyncHandle, WriteHandle,
    },
    config::RepoConfig,
    ingest::BulkIngest,
    prefixes::ReadPrefixes,
    pubsub::PubSub,
    storage,
    sync::{SyncEngine, SyncSettings},
    transport::Transport,
};

/// A running repository.
///
/// Commands arrive over pub/sub on the topics of [`Operation`], or in-process through
/// [`Repo::insert`] and friends. Dropping the repository stops its background tasks
/// without flushing; call [`Repo::shutdown`] for an orderly stop.
#[derive(Debug)]
pub struct Repo<T> {
    config: RepoConfig,
    transport: T,
    cache: Cache,
    prefixes: ReadPrefixes<T>,
    pubsub: PubSub<T>,
    write: WriteHandle<T>,
    delete: DeleteHandle<T>,
    sync: SyncHandle<T>,
    ingest: Option<BulkIngest>,
    shutdown: CancellationToken,
    _flusher: AbortOnDropHandle<()>,
}

impl<T: Transport> Repo<T> {
    /// Opens the storage, restores the persisted state and starts serving.
    pub async fn spawn(config: RepoConfig, transport: T) -> Result<Self> {
        let storage = storage::open(&config.storage).context("failed to open storage")?;
        let cache = Cache::new(storage);
        let flusher = cache.spawn_flusher(config.flush_interval);

        let prefixes = ReadPrefixes::new(transport.clone(), cache.clone());
        let restored = prefixes.recover()?;
        debug!(restored, "read prefixes restored");
        if config.register_root && !prefixes.contains(&Name::root()) {
            prefixes.register(&Name::root())?;
        }

        let shutdown = CancellationToken::new();
        let ctx = HandlerContext {
            transport: transport.clone(),
            cache: cache.clone(),
            prefixes: prefixes.clone(),
            repo_name: config.repo_name.clone(),
            register_root: config.register_root,
            fetch: config.fetch.clone(),
            shutdown: shutdown.clone(),
        };
        let write = WriteHandle::new(ctx.clone(), Processes::default(), config.insert_record_grace);
        let delete = DeleteHandle::new(ctx, Processes::default(), config.delete_record_grace);
        let engine = SyncEngine::new(
            transport.clone(),
            cache.clone(),
            prefixes.clone(),
            SyncSettings {
                fetch: config.fetch.clone(),
                dedupe_window: config.sync_dedupe_window,
                register_root: config.register_root,
            },
        );
        let sync = SyncHandle::new(engine, config.insert_record_grace, shutdown.clone());

        let repo_name = &config.repo_name;
        let pubsub = PubSub::new(transport.clone(), repo_name.clone());
        let handle = write.clone();
        pubsub.subscribe(&Operation::Insert.topic(repo_name), move |payload: Bytes| {
            handle.on_command(&payload);
        })?;
        let handle = delete.clone();
        pubsub.subscribe(&Operation::Delete.topic(repo_name), move |payload: Bytes| {
            handle.on_command(&payload);
        })?;
        let handle = sync.clone();
        pubsub.subscribe(&Operation::SyncJoin.topic(repo_name), move |payload: Bytes| {
            handle.on_join(&payload);
        })?;
        let handle = sync.clone();
        pubsub.subscribe(&Operation::SyncLeave.topic(repo_name), move |payload: Bytes| {
            handle.on_leave(&payload);
        })?;

        transport.register(
            Operation::Insert.check_route(repo_name),
            check_responder(write.processes()),
        )?;
        transport.register(
            Operation::Delete.check_route(repo_name),
            check_responder(delete.processes()),
        )?;
        transport.register(
            Operation::SyncJoin.check_route(repo_name),
            check_responder(sync.join_processes()),
        )?;
        transport.register(
            Operation::SyncLeave.check_route(repo_name),
            check_responder(sync.leave_processes()),
        )?;

        let groups = sync.engine().recover()?;
        debug!(groups, "sync groups restored");

        let ingest = match config.bulk_insert_addr {
            Some(addr) => Some(BulkIngest::bind(addr, cache.clone()).await?),
            None => None,
        };

        info!(name = %repo_name, "repository started");
        Ok(Self {
            config,
            transport,
            cache,
            prefixes,
            pubsub,
            write,
            delete,
            sync,
            ingest,
            shutdown,
            _flusher: flusher,
        })
    }

    /// The repository name.
    pub fn name(&self) -> &Name {
        &self.config.repo_name
    }

    /// The cache in front of the storage.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The read prefix registry.
    pub fn prefixes(&self) -> &ReadPrefixes<T> {
        &self.prefixes
    }

    /// The sync engine.
    pub fn sync(&self) -> &SyncEngine<T> {
        self.sync.engine()
    }

    /// Address of the bulk ingestion listener, if enabled.
    pub fn bulk_insert_addr(&self) -> Option<SocketAddr> {
        self.ingest.as_ref().map(BulkIngest::local_addr)
    }

    /// Submits an insert command.
    pub fn insert(&self, command: &RepoCommand) -> Result<RepoCommandResponse> {
        Ok(self.write.on_command(&command.encode()?))
    }

    /// Submits a delete command.
    pub fn delete(&self, command: &RepoCommand) -> Result<RepoCommandResponse> {
        Ok(self.delete.on_command(&command.encode()?))
    }

    /// Submits a sync join command.
    pub fn join(&self, command: &SyncCommand) -> Result<SyncCommandResponse> {
        Ok(self.sync.on_join(&command.encode()?))
    }

    /// Submits a sync leave command.
    pub fn leave(&self, command: &SyncCommand) -> Result<SyncCommandResponse> {
        Ok(self.sync.on_leave(&command.encode()?))
    }

    /// Records of insert commands.
    pub fn insert_processes(&self) -> &Processes<RepoCommandResponse> {
        self.write.processes()
    }

    /// Records of delete commands.
    pub fn delete_processes(&self) -> &Processes<RepoCommandResponse> {
        self.delete.processes()
    }

    /// Records of sync join commands.
    pub fn join_processes(&self) -> &Processes<SyncCommandResponse> {
        self.sync.join_processes()
    }

    /// Records of sync leave commands.
    pub fn leave_processes(&self) -> &Processes<SyncCommandResponse> {
        self.sync.leave_processes()
    }

    /// Stops all processing, withdraws every route and flushes the cache.
    ///
    /// The persisted state is kept, a repository spawned on the same storage resumes from it.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(ingest) = &self.ingest {
            ingest.shutdown();
        }
        let repo_name = &self.config.repo_name;
        for op in Operation::iter() {
            self.pubsub.unsubscribe(&op.topic(repo_name));
            self.transport.unregister(&op.check_route(repo_name));
        }
        self.write.shutdown();
        self.delete.shutdown();
        self.sync.engine().shutdown();
        self.prefixes.shutdown();
        match self.cache.flush() {
            Ok(count) => debug!(count, "final flush"),
            Err(err) => {
                warn!(?err, "final flush failed");
                return Err(err);
            }
        }
        info!(name = %repo_name, "repository stopped");
        Ok(())
    }
}
