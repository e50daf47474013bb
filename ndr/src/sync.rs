//! State vector replication between repositories.
//!
//! Each joined group listens on its sync prefix for state vector advertisements sent by
//! the group's producers and by other repositories. An advertisement carries the
//! sender's vector as interest parameters, addressed to `<sync prefix>/<params digest>`.
//!
//! A repository never advertises a vector of its own. It adopts every newer sequence
//! number it hears about and remembers the advertisement that announced it. When a
//! peer is behind or lacks a node, the remembered advertisements are sent again so the
//! peer can catch up.
//!
//! Data for a node is fetched from `<node>/<sync prefix>/seq=<n>` for every `n` past the
//! stored progress. Content that is itself a name points to a segmented object, which
//! is fetched in full as well.
//!
//! The set of joined groups is persisted under [`SYNC_GROUPS_KEY`] and every group
//! under `sync_states/<sync prefix>`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ndr_base::Name;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::Cache, command::SyncParam, config::FetchConfig, prefixes::ReadPrefixes,
    storage::Storage, transport::Transport,
};

mod group;
pub mod state;

pub use self::{
    group::{state_key, SyncGroup},
    state::{GroupState, StateVector},
};

/// Storage key of the set of joined groups.
pub const SYNC_GROUPS_KEY: &[u8] = b"sync_groups";

/// Result of joining a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum JoinOutcome {
    /// The group was joined.
    Joined,
    /// The group was already joined and left untouched.
    AlreadyJoined,
    /// The group was already joined and its state was rebuilt.
    Reset,
}

/// Settings of the sync engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Fetch settings for missing data.
    pub fetch: FetchConfig,
    /// Window in which repeated advertisements are ignored.
    pub dedupe_window: Duration,
    /// Whether the repository serves the whole namespace.
    pub register_root: bool,
}

/// The joined sync groups of a repository.
#[derive(Debug, Clone)]
pub struct SyncEngine<T> {
    transport: T,
    cache: Cache,
    prefixes: ReadPrefixes<T>,
    settings: SyncSettings,
    groups: Arc<Mutex<BTreeMap<Name, SyncGroup<T>>>>,
}

impl<T: Transport> SyncEngine<T> {
    /// Creates an engine without groups.
    pub fn new(transport: T, cache: Cache, prefixes: ReadPrefixes<T>, settings: SyncSettings) -> Self {
        Self {
            transport,
            cache,
            prefixes,
            settings,
            groups: Default::default(),
        }
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.cache.storage()
    }

    fn group_from(&self, state: GroupState) -> SyncGroup<T> {
        SyncGroup::new(
            state,
            self.transport.clone(),
            self.cache.clone(),
            self.settings.fetch.clone(),
            self.settings.dedupe_window,
        )
    }

    /// Joins the group described by `param`, or resets it if already joined and
    /// `param.reset` is set.
    pub fn join(&self, param: &SyncParam) -> Result<JoinOutcome> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(&param.sync_prefix) {
            if param.reset {
                group.reset()?;
                return Ok(JoinOutcome::Reset);
            }
            return Ok(JoinOutcome::AlreadyJoined);
        }
        let group = self.group_from(GroupState::new(param));
        group.listen()?;
        group.persist()?;
        if let Some(prefix) = &param.register_prefix {
            if !self.settings.register_root {
                self.prefixes.register(prefix)?;
            }
        }
        groups.insert(param.sync_prefix.clone(), group);
        self.persist_groups(&groups)?;
        info!(group = %param.sync_prefix, "joined sync group");
        Ok(JoinOutcome::Joined)
    }

    /// Leaves the group `sync_prefix`. Returns `false` if it was not joined.
    pub fn leave(&self, sync_prefix: &Name) -> Result<bool> {
        let mut groups = self.groups.lock();
        let Some(group) = groups.remove(sync_prefix) else {
            return Ok(false);
        };
        group.stop();
        if let Some(prefix) = group.state().register_prefix {
            if !self.settings.register_root {
                self.prefixes.unregister(&prefix)?;
            }
        }
        self.storage().remove(&state_key(sync_prefix))?;
        self.persist_groups(&groups)?;
        info!(group = %sync_prefix, "left sync group");
        Ok(true)
    }

    /// Restores the persisted groups and resumes fetching. Returns how many were restored.
    ///
    /// Groups whose state cannot be read or that cannot listen for advertisements are
    /// skipped.
    pub fn recover(&self) -> Result<usize> {
        let Some(bytes) = self.storage().get(SYNC_GROUPS_KEY, false, false)? else {
            return Ok(0);
        };
        let prefixes: Vec<Name> = match postcard::from_bytes(&bytes) {
            Ok(prefixes) => prefixes,
            Err(err) => {
                warn!(?err, "discarding undecodable sync group set");
                return Ok(0);
            }
        };
        let mut groups = self.groups.lock();
        for prefix in prefixes {
            let state = match self.load_state(&prefix) {
                Ok(state) => state,
                Err(err) => {
                    warn!(group = %prefix, ?err, "skipping sync group");
                    continue;
                }
            };
            let group = self.group_from(state);
            if let Err(err) = group.listen() {
                warn!(group = %prefix, ?err, "skipping sync group");
                continue;
            }
            group.schedule_fetches();
            debug!(group = %prefix, "sync group restored");
            groups.insert(prefix, group);
        }
        self.persist_groups(&groups)?;
        Ok(groups.len())
    }

    fn load_state(&self, prefix: &Name) -> Result<GroupState> {
        let bytes = self
            .storage()
            .get(&state_key(prefix), false, false)?
            .context("no persisted state")?;
        let state: GroupState = postcard::from_bytes(&bytes).context("undecodable state")?;
        anyhow::ensure!(&state.sync_prefix == prefix, "state of {}", state.sync_prefix);
        Ok(state)
    }

    /// The group `sync_prefix`, if joined.
    pub fn group(&self, sync_prefix: &Name) -> Option<SyncGroup<T>> {
        self.groups.lock().get(sync_prefix).cloned()
    }

    /// The sync prefixes of all joined groups.
    pub fn groups(&self) -> Vec<Name> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Stops all groups without forgetting them.
    pub fn shutdown(&self) {
        for group in self.groups.lock().values() {
            group.stop();
        }
    }

    fn persist_groups(&self, groups: &BTreeMap<Name, SyncGroup<T>>) -> Result<()> {
        let prefixes: Vec<&Name> = groups.keys().collect();
        let bytes = postcard::to_stdvec(&prefixes)?;
        self.storage().put(SYNC_GROUPS_KEY, &bytes, None)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::atomic::{AtomicU64, Ordering},
    };

    use bytes::Bytes;
    use ndr_base::{Component, Data};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        storage::mem,
        sync::state::advertisement,
        transport::{
            mem::{MemNetwork, MemTransport},
            responder, Interest, RequestError, Responder,
        },
    };

    /// A transport that refuses to serve one prefix.
    #[derive(Debug, Clone)]
    struct Refusing {
        inner: MemTransport,
        refused: Name,
    }

    impl Transport for Refusing {
        fn express(
            &self,
            interest: Interest,
        ) -> impl Future<Output = Result<Data, RequestError>> + Send {
            self.inner.express(interest)
        }

        fn multicast(&self, interest: Interest) {
            self.inner.multicast(interest)
        }

        fn register(&self, prefix: Name, responder: Responder) -> Result<()> {
            anyhow::ensure!(prefix != self.refused, "{prefix} refused");
            self.inner.register(prefix, responder)
        }

        fn unregister(&self, prefix: &Name) -> bool {
            self.inner.unregister(prefix)
        }
    }

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn engine_on(net: &MemNetwork, storage: Arc<dyn Storage>) -> SyncEngine<MemTransport> {
        engine_with(net.endpoint(), storage)
    }

    fn engine_with<T: Transport>(transport: T, storage: Arc<dyn Storage>) -> SyncEngine<T> {
        let cache = Cache::new(storage);
        let prefixes = ReadPrefixes::new(transport.clone(), cache.clone());
        SyncEngine::new(
            transport,
            cache,
            prefixes,
            SyncSettings {
                fetch: FetchConfig {
                    lifetime: Duration::from_millis(200),
                    max_retries: 2,
                    ..Default::default()
                },
                dedupe_window: Duration::from_secs(2),
                register_root: false,
            },
        )
    }

    /// A producer node publishing `count` sequence numbers in `group`.
    fn producer(net: &MemNetwork, node: &Name, group: &Name, count: u64) -> MemTransport {
        let endpoint = net.endpoint();
        let base = node.join(group);
        let b = base.clone();
        endpoint
            .register(
                base,
                responder(move |interest: Interest| {
                    let b = b.clone();
                    async move {
                        let seq = interest.name.last()?.as_sequence()?;
                        (seq >= 1 && seq <= count).then(|| Data::new(b.append_sequence(seq), format!("update {seq}")))
                    }
                }),
            )
            .unwrap();
        endpoint
    }

    async fn wait_progress(engine: &SyncEngine<MemTransport>, group: &Name, node: &Name, seq: u64) {
        loop {
            let state = engine.group(group).unwrap().state();
            if state.progress.get(node) == Some(seq) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn join_fetch_leave() -> Result<()> {
        let net = MemNetwork::new();
        let storage: Arc<dyn Storage> = Arc::new(mem::Store::default());
        let engine = engine_on(&net, storage.clone());
        let group = name("/chat");
        let alice = name("/alice");
        let _alice = producer(&net, &alice, &group, 4);

        let param = SyncParam {
            register_prefix: Some(name("/alice")),
            ..SyncParam::new(group.clone())
        };
        assert_eq!(engine.join(&param)?, JoinOutcome::Joined);
        assert_eq!(engine.join(&param)?, JoinOutcome::AlreadyJoined);

        let sender = net.endpoint();
        let vector: StateVector = [(alice.clone(), 4)].into_iter().collect();
        sender.multicast(advertisement(&group, vector.encode()));
        wait_progress(&engine, &group, &alice, 4).await;
        let stored = engine
            .cache
            .get(&alice.join(&group).append_sequence(3), false, false)?
            .unwrap();
        assert_eq!(stored.content, "update 3");
        assert!(storage.get(&state_key(&group), false, false)?.is_some());

        assert!(engine.leave(&group)?);
        assert!(!engine.leave(&group)?);
        assert!(storage.get(&state_key(&group), false, false)?.is_none());
        assert!(!engine.prefixes.contains(&name("/alice")));
        assert!(engine.groups().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn lagging_replica_catches_up() -> Result<()> {
        let net = MemNetwork::new();
        let group = name("/chat");
        let node = name("/A");
        let _producer = producer(&net, &node, &group, 5);

        let leader = engine_on(&net, Arc::new(mem::Store::default()));
        leader.join(&SyncParam::new(group.clone()))?;
        let sender = net.endpoint();
        let ahead: StateVector = [(node.clone(), 5)].into_iter().collect();
        sender.multicast(advertisement(&group, ahead.encode()));
        wait_progress(&leader, &group, &node, 5).await;

        let lagging = engine_on(&net, Arc::new(mem::Store::default()));
        lagging.join(&SyncParam::new(group.clone()))?;
        let behind: StateVector = [(node.clone(), 3)].into_iter().collect();
        sender.multicast(advertisement(&group, behind.encode()));

        // the leader answers the stale vector with the advertisement for 5
        wait_progress(&lagging, &group, &node, 5).await;
        assert_eq!(
            lagging.group(&group).unwrap().state().known,
            leader.group(&group).unwrap().state().known
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn follows_pointers() -> Result<()> {
        let net = MemNetwork::new();
        let group = name("/files");
        let node = name("/B");
        let object = name("/B/report");

        let endpoint = net.endpoint();
        let sync_base = node.join(&group);
        let pointer = Bytes::from(object.encode());
        let sb = sync_base.clone();
        endpoint.register(
            sync_base,
            responder(move |interest: Interest| {
                let data = Data::new(sb.append_sequence(1), pointer.clone());
                async move { (interest.name.last()?.as_sequence()? == 1).then_some(data) }
            }),
        )?;
        let ob = object.clone();
        endpoint.register(
            object.clone(),
            responder(move |interest: Interest| {
                let ob = ob.clone();
                async move {
                    let seg = interest.name.last()?.as_segment()?;
                    (seg < 3).then(|| {
                        Data::new(ob.append_segment(seg), "chunk")
                            .with_final_block_id(Component::segment(2))
                    })
                }
            }),
        )?;

        let engine = engine_on(&net, Arc::new(mem::Store::default()));
        engine.join(&SyncParam::new(group.clone()))?;
        let vector: StateVector = [(node.clone(), 1)].into_iter().collect();
        net.endpoint().multicast(advertisement(&group, vector.encode()));
        wait_progress(&engine, &group, &node, 1).await;
        for seg in 0..3 {
            assert!(engine.cache.get(&object.append_segment(seg), false, false)?.is_some());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reset_and_recover() -> Result<()> {
        let net = MemNetwork::new();
        let storage: Arc<dyn Storage> = Arc::new(mem::Store::default());
        let group = name("/chat");
        let node = name("/C");

        let engine = engine_on(&net, storage.clone());
        engine.join(&SyncParam::new(group.clone()))?;
        // nothing serves /C yet: the claim of 6 stays unfetched
        let vector: StateVector = [(node.clone(), 6)].into_iter().collect();
        net.endpoint().multicast(advertisement(&group, vector.encode()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.group(&group).unwrap().state().known.get(&node), Some(6));

        let reset = SyncParam {
            reset: true,
            ..SyncParam::new(group.clone())
        };
        assert_eq!(engine.join(&reset)?, JoinOutcome::Reset);
        assert!(engine.group(&group).unwrap().state().known.is_empty());

        // a corrupt record is skipped, the intact one restored
        let other = name("/other");
        engine.join(&SyncParam::new(other.clone()))?;
        storage.put(&state_key(&other), b"\xff\xff", None)?;
        engine.shutdown();

        let _producer = producer(&net, &node, &group, 2);
        let restored = engine_on(&net, storage);
        let vector: StateVector = [(node.clone(), 2)].into_iter().collect();
        assert_eq!(restored.recover()?, 1);
        assert_eq!(restored.groups(), vec![group.clone()]);
        net.endpoint().multicast(advertisement(&group, vector.encode()));
        wait_progress(&restored, &group, &node, 2).await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn reset_cancels_running_fetches() -> Result<()> {
        let net = MemNetwork::new();
        let group = name("/chat");
        let node = name("/slow");
        let base = node.join(&group);
        let requests = Arc::new(AtomicU64::new(0));

        let endpoint = net.endpoint();
        let b = base.clone();
        let counter = requests.clone();
        endpoint.register(
            base.clone(),
            responder(move |interest: Interest| {
                counter.fetch_add(1, Ordering::Relaxed);
                let b = b.clone();
                async move {
                    let seq = interest.name.last()?.as_sequence()?;
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Some(Data::new(b.append_sequence(seq), "late"))
                }
            }),
        )?;

        let engine = engine_on(&net, Arc::new(mem::Store::default()));
        engine.join(&SyncParam::new(group.clone()))?;
        let vector: StateVector = [(node.clone(), 5)].into_iter().collect();
        net.endpoint().multicast(advertisement(&group, vector.encode()));
        while requests.load(Ordering::Relaxed) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reset = SyncParam {
            reset: true,
            ..SyncParam::new(group.clone())
        };
        assert_eq!(engine.join(&reset)?, JoinOutcome::Reset);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let state = engine.group(&group).unwrap().state();
        assert_eq!(state.progress.get(&node), None);
        assert!(state.known.is_empty());
        for seq in 1..=5 {
            assert!(engine.cache.get(&base.append_sequence(seq), false, false)?.is_none());
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dedupe_skips_stored_objects() -> Result<()> {
        let net = MemNetwork::new();
        let group = name("/files");
        let node = name("/B");
        let object = name("/B/report");

        let endpoint = net.endpoint();
        let sync_base = node.join(&group);
        let pointer = Bytes::from(object.encode());
        let sb = sync_base.clone();
        endpoint.register(
            sync_base,
            responder(move |interest: Interest| {
                let data = Data::new(sb.append_sequence(1), pointer.clone());
                async move { (interest.name.last()?.as_sequence()? == 1).then_some(data) }
            }),
        )?;
        let requests = Arc::new(AtomicU64::new(0));
        let counter = requests.clone();
        endpoint.register(
            object.clone(),
            responder(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { None }
            }),
        )?;

        let engine = engine_on(&net, Arc::new(mem::Store::default()));
        engine.cache.put(
            &Data::new(object.append_segment(0), "cached").with_final_block_id(Component::segment(0)),
        );
        engine.join(&SyncParam {
            data_name_dedupe: true,
            ..SyncParam::new(group.clone())
        })?;
        let vector: StateVector = [(node.clone(), 1)].into_iter().collect();
        net.endpoint().multicast(advertisement(&group, vector.encode()));
        wait_progress(&engine, &group, &node, 1).await;
        assert!(engine.cache.get(&node.join(&group).append_sequence(1), false, false)?.is_some());
        assert_eq!(requests.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn leave_keeps_shared_read_prefix() -> Result<()> {
        let net = MemNetwork::new();
        let engine = engine_on(&net, Arc::new(mem::Store::default()));
        let shared = name("/alice");
        let group = name("/chat");
        // served for an inserted object as well
        assert!(engine.prefixes.register(&shared)?);
        engine.join(&SyncParam {
            register_prefix: Some(shared.clone()),
            ..SyncParam::new(group.clone())
        })?;
        assert!(engine.leave(&group)?);
        assert!(engine.prefixes.contains(&shared));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn recover_skips_groups_that_cannot_listen() -> Result<()> {
        let net = MemNetwork::new();
        let storage: Arc<dyn Storage> = Arc::new(mem::Store::default());
        let engine = engine_on(&net, storage.clone());
        engine.join(&SyncParam::new(name("/a")))?;
        engine.join(&SyncParam::new(name("/b")))?;
        engine.join(&SyncParam::new(name("/c")))?;
        engine.shutdown();

        let transport = Refusing {
            inner: net.endpoint(),
            refused: name("/a"),
        };
        let restored = engine_with(transport, storage);
        assert_eq!(restored.recover()?, 2);
        assert_eq!(restored.groups(), vec![name("/b"), name("/c")]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_invalid_advertisements() -> Result<()> {
        let net = MemNetwork::new();
        let engine = engine_on(&net, Arc::new(mem::Store::default()));
        let group = name("/chat");
        engine.join(&SyncParam::new(group.clone()))?;
        let sender = net.endpoint();

        let mut forged = advertisement(&group, StateVector::default().encode());
        forged.app_params = Some([(name("/D"), 9)].into_iter().collect::<StateVector>().encode());
        sender.multicast(forged);
        sender.multicast(advertisement(&group, Bytes::from_static(b"\xff\xff\xff")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.group(&group).unwrap().state().known.is_empty());
        Ok(())
    }
}
