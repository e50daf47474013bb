//! State vectors and the advertisement round of a sync group.
//!
//! [`SvsCore`] holds no IO: it takes received advertisements and returns what to
//! retransmit, and whether newer data became known. The caller does the networking.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use bytes::Bytes;
use ndr_base::Name;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{command::SyncParam, transport::Interest};

/// Lifetime of advertisement interests.
pub const ADVERTISEMENT_LIFETIME: Duration = Duration::from_secs(1);

/// State vector of a sync group.
///
/// Contains the highest sequence number for each producer node.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct StateVector {
    heads: BTreeMap<Name, u64>,
}

impl StateVector {
    /// Insert a new sequence number, keeping the higher of the old and new one.
    pub fn insert(&mut self, node: Name, seq: u64) {
        self.heads
            .entry(node)
            .and_modify(|s| *s = (*s).max(seq))
            .or_insert(seq);
    }

    /// The sequence number of `node`.
    pub fn get(&self, node: &Name) -> Option<u64> {
        self.heads.get(node).copied()
    }

    /// Whether `node` has an entry.
    pub fn contains(&self, node: &Name) -> bool {
        self.heads.contains_key(node)
    }

    /// Can this state vector offer newer stuff to `other`?
    pub fn has_news_for(&self, other: &Self) -> bool {
        self.heads
            .iter()
            .any(|(node, seq)| other.get(node).map_or(true, |o| *seq > o))
    }

    /// Merge another state vector into this one.
    pub fn merge(&mut self, other: &Self) {
        for (node, seq) in other.iter() {
            self.insert(node.clone(), *seq);
        }
    }

    /// Create an iterator over the entries in this state vector.
    pub fn iter(&self) -> std::collections::btree_map::Iter<Name, u64> {
        self.heads.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether no node is known.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Encodes the vector as advertisement parameters.
    pub fn encode(&self) -> Bytes {
        postcard::to_stdvec(self)
            .expect("serializing to a vec is infallible")
            .into()
    }

    /// Decodes advertisement parameters.
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

impl FromIterator<(Name, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (Name, u64)>>(iter: I) -> Self {
        let mut vector = Self::default();
        for (node, seq) in iter {
            vector.insert(node, seq);
        }
        vector
    }
}

/// The advertisement interest carrying `params` for the group `sync_prefix`.
pub fn advertisement(sync_prefix: &Name, params: Bytes) -> Interest {
    Interest::with_params(sync_prefix, params).lifetime(ADVERTISEMENT_LIFETIME)
}

/// Persisted state of one sync group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    /// The group's sync prefix.
    pub sync_prefix: Name,
    /// Prefix reads are served under.
    pub register_prefix: Option<Name>,
    /// Skip fetching pointed-to objects that are already stored.
    pub data_name_dedupe: bool,
    /// Highest sequence number known to exist, per node.
    pub known: StateVector,
    /// Highest sequence number stored, per node.
    pub progress: StateVector,
    /// The advertisement that established each entry of `known`.
    pub advertisements: BTreeMap<Name, Bytes>,
}

impl GroupState {
    /// Fresh state for a newly joined group.
    pub fn new(param: &SyncParam) -> Self {
        Self {
            sync_prefix: param.sync_prefix.clone(),
            register_prefix: param.register_prefix.clone(),
            data_name_dedupe: param.data_name_dedupe,
            ..Default::default()
        }
    }
}

/// What a received advertisement requires from the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Round {
    /// Newer data became known for some node.
    pub advanced: bool,
    /// Advertisements to send again, each at most once per dedupe window.
    pub retransmit: Vec<Bytes>,
}

/// The advertisement state machine of one sync group.
#[derive(Debug)]
pub struct SvsCore {
    state: GroupState,
    /// Digests of advertisements received within the window.
    received: HashMap<blake3::Hash, Instant>,
    /// Digests of advertisements retransmitted within the window.
    sent: HashMap<blake3::Hash, Instant>,
    window: Duration,
}

impl SvsCore {
    /// Wraps `state`, ignoring repeated advertisements for `window`.
    pub fn new(state: GroupState, window: Duration) -> Self {
        Self {
            state,
            received: HashMap::new(),
            sent: HashMap::new(),
            window,
        }
    }

    /// The current state.
    pub fn state(&self) -> &GroupState {
        &self.state
    }

    /// Processes the advertisement `params` received at `now`.
    ///
    /// Returns `None` for an advertisement already seen within the dedupe window.
    pub fn on_advertisement(
        &mut self,
        params: &Bytes,
        now: Instant,
    ) -> Result<Option<Round>, postcard::Error> {
        let window = self.window;
        self.received.retain(|_, at| now.duration_since(*at) < window);
        self.sent.retain(|_, at| now.duration_since(*at) < window);
        let digest = blake3::hash(params);
        if self.received.contains_key(&digest) {
            return Ok(None);
        }
        let peer = StateVector::decode(params)?;
        self.received.insert(digest, now);

        let mut round = Round::default();
        let mut retransmit = BTreeSet::new();
        for (node, seq) in peer.iter() {
            match self.state.known.get(node) {
                Some(local) if local > *seq => {
                    if let Some(ad) = self.state.advertisements.get(node) {
                        retransmit.insert(ad.clone());
                    }
                }
                Some(local) if local == *seq => {}
                local => {
                    self.state.known.insert(node.clone(), *seq);
                    self.state
                        .advertisements
                        .insert(node.clone(), params.clone());
                    round.advanced |= *seq > local.unwrap_or(0);
                }
            }
        }
        if self.state.known.iter().any(|(node, _)| !peer.contains(node)) {
            retransmit.extend(self.state.advertisements.values().cloned());
        }
        // the sender already has the advertisement it sent
        retransmit.remove(params);
        round.retransmit = retransmit
            .into_iter()
            .filter(|ad| self.sent.insert(blake3::hash(ad), now).is_none())
            .collect();
        Ok(Some(round))
    }

    /// Ranges `(node, first, last)` known to exist but not stored yet.
    pub fn missing(&self) -> Vec<(Name, u64, u64)> {
        self.state
            .known
            .iter()
            .filter_map(|(node, known)| {
                let stored = self.state.progress.get(node).unwrap_or(0);
                (stored < *known).then(|| (node.clone(), stored + 1, *known))
            })
            .collect()
    }

    /// The missing range of `node`.
    pub fn missing_for(&self, node: &Name) -> Option<(u64, u64)> {
        let known = self.state.known.get(node)?;
        let stored = self.state.progress.get(node).unwrap_or(0);
        (stored < known).then_some((stored + 1, known))
    }

    /// Records that `seq` of `node` is stored.
    pub fn record_progress(&mut self, node: &Name, seq: u64) {
        self.state.progress.insert(node.clone(), seq);
    }

    /// Forgets claims about data that was never stored: the known vector becomes the
    /// stored progress.
    pub fn reset(&mut self) {
        self.state.known = self.state.progress.clone();
        self.state.advertisements.clear();
        self.received.clear();
        self.sent.clear();
    }
}
