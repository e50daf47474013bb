//! Repository commands and their processing.
//!
//! A command arrives as a postcard encoded payload, either through pub/sub or
//! in-process. Acceptance is synchronous: the payload is decoded and validated, and a
//! process record with status [`StatusCode::Roger`] is stored before any work starts.
//! The work runs as a background task which moves the record through
//! [`StatusCode::InProgress`] to [`StatusCode::Completed`] or [`StatusCode::Failed`].
//! A record stays queryable through the check routes for a grace period after it
//! reached a terminal status.
//!
//! Submitting the same payload twice yields the same [`RequestId`] and is answered with
//! the existing record without starting any new work.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use ndr_base::{Data, Name};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    cache::Cache,
    config::FetchConfig,
    prefixes::ReadPrefixes,
    transport::{responder, Interest, Responder, Transport},
};

pub mod delete;
pub mod sync;
pub mod write;

pub use self::{delete::DeleteHandle, sync::SyncHandle, write::WriteHandle};

/// Status of a command or of one of its objects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum StatusCode {
    /// Accepted, work not started yet.
    Roger = 100,
    /// Finished successfully.
    Completed = 200,
    /// Work in progress.
    InProgress = 300,
    /// Finished unsuccessfully.
    Failed = 400,
    /// The command or query could not be decoded or is inconsistent.
    Malformed = 403,
    /// No such process or object.
    NotFound = 404,
    /// The object name overlaps the repository namespace.
    Conflict = 409,
}

impl StatusCode {
    /// The numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether no further transitions will happen.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusCode::Roger | StatusCode::InProgress)
    }
}

/// Identifies a command: the blake3 digest of its payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId([u8; 32]);

impl RequestId {
    /// The id of the command encoded as `payload`.
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// The raw digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for logging.
    pub fn fmt_short(&self) -> String {
        blake3::Hash::from(self.0).to_hex()[..10].to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", blake3::Hash::from(self.0).to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.fmt_short())
    }
}

/// The four command kinds and their routes under the repository name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Insert objects.
    Insert,
    /// Delete objects.
    Delete,
    /// Join sync groups.
    SyncJoin,
    /// Leave sync groups.
    SyncLeave,
}

impl Operation {
    /// Topic commands of this kind are published on.
    pub fn topic(&self, repo: &Name) -> Name {
        match self {
            Operation::Insert => repo.append_generic("insert"),
            Operation::Delete => repo.append_generic("delete"),
            Operation::SyncJoin => repo.append_generic("sync").append_generic("join"),
            Operation::SyncLeave => repo.append_generic("sync").append_generic("leave"),
        }
    }

    /// Prefix answering status checks for commands of this kind.
    pub fn check_route(&self, repo: &Name) -> Name {
        self.topic(repo).append_generic("check")
    }
}

/// One object of an insert or delete command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectParam {
    /// Object name, without segment component.
    pub name: Name,
    /// First segment, inclusive.
    pub start_block_id: Option<u64>,
    /// Last segment, inclusive.
    pub end_block_id: Option<u64>,
    /// Forwarding hint for fetching the object.
    pub forwarding_hint: Option<Name>,
    /// Prefix to serve reads under once inserted. Defaults to the object name.
    pub register_prefix: Option<Name>,
}

impl ObjectParam {
    /// An object addressed by exact name.
    pub fn new(name: Name) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Sets the segment range.
    pub fn range(mut self, start: u64, end: Option<u64>) -> Self {
        self.start_block_id = Some(start);
        self.end_block_id = end;
        self
    }

    fn validate(&self) -> Result<(), String> {
        match (self.start_block_id, self.end_block_id) {
            (None, Some(_)) => Err(format!("{}: end block id without start block id", self.name)),
            (Some(start), Some(end)) if start > end => {
                Err(format!("{}: start block id {start} after end {end}", self.name))
            }
            _ => Ok(()),
        }
    }
}

/// Insert or delete command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCommand {
    /// Objects to process.
    pub objects: Vec<ObjectParam>,
    /// Additional prefix to answer status checks under.
    pub check_prefix: Option<Name>,
}

impl RepoCommand {
    /// Encodes the command.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    fn validate(&self) -> Result<(), String> {
        if self.objects.is_empty() {
            return Err("no objects".to_string());
        }
        self.objects.iter().try_for_each(ObjectParam::validate)
    }
}

/// Outcome for one object of a [`RepoCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectResult {
    /// Object name.
    pub name: Name,
    /// Object status.
    pub status_code: StatusCode,
    /// Number of objects stored.
    pub insert_num: u64,
    /// Number of objects removed.
    pub delete_num: u64,
}

impl ObjectResult {
    fn new(name: Name) -> Self {
        Self {
            name,
            status_code: StatusCode::Roger,
            insert_num: 0,
            delete_num: 0,
        }
    }
}

/// Process record and response of insert and delete commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCommandResponse {
    /// Request id, absent when the request could not be decoded.
    pub request_no: Option<RequestId>,
    /// Overall status.
    pub status_code: StatusCode,
    /// Per object outcome.
    pub objects: Vec<ObjectResult>,
}

/// One group of a [`SyncCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParam {
    /// The group's sync prefix.
    pub sync_prefix: Name,
    /// Prefix to serve reads under.
    pub register_prefix: Option<Name>,
    /// Skip fetching pointed-to objects that are already stored.
    pub data_name_dedupe: bool,
    /// Rebuild the state of an already joined group.
    pub reset: bool,
}

impl SyncParam {
    /// A group with default flags.
    pub fn new(sync_prefix: Name) -> Self {
        Self {
            sync_prefix,
            ..Default::default()
        }
    }
}

/// Sync join or leave command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommand {
    /// Groups to join or leave.
    pub sync_groups: Vec<SyncParam>,
}

impl SyncCommand {
    /// Encodes the command.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    fn validate(&self) -> Result<(), String> {
        if self.sync_groups.is_empty() {
            return Err("no sync groups".to_string());
        }
        for group in &self.sync_groups {
            if group.register_prefix.as_ref() == Some(&group.sync_prefix) {
                return Err(format!(
                    "{}: register prefix equals sync prefix",
                    group.sync_prefix
                ));
            }
        }
        Ok(())
    }
}

/// Outcome for one sync group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// The group's sync prefix.
    pub sync_prefix: Name,
    /// Group status.
    pub status_code: StatusCode,
}

/// Process record and response of sync commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommandResponse {
    /// Request id, absent when the request could not be decoded.
    pub request_no: Option<RequestId>,
    /// Overall status.
    pub status_code: StatusCode,
    /// Per group outcome.
    pub sync_groups: Vec<SyncStatus>,
}

/// Payload of a status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    /// Request to look up.
    pub request_no: RequestId,
}

/// A process record.
pub trait Record: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + 'static {
    /// A record carrying only a status, used for malformed and unknown requests.
    fn bare(request_no: Option<RequestId>, status_code: StatusCode) -> Self;

    /// Overall status.
    fn status(&self) -> StatusCode;
}

impl Record for RepoCommandResponse {
    fn bare(request_no: Option<RequestId>, status_code: StatusCode) -> Self {
        Self {
            request_no,
            status_code,
            objects: Vec::new(),
        }
    }

    fn status(&self) -> StatusCode {
        self.status_code
    }
}

impl Record for SyncCommandResponse {
    fn bare(request_no: Option<RequestId>, status_code: StatusCode) -> Self {
        Self {
            request_no,
            status_code,
            sync_groups: Vec::new(),
        }
    }

    fn status(&self) -> StatusCode {
        self.status_code
    }
}

/// Process records of one command kind, keyed by request id.
#[derive(Debug)]
pub struct Processes<R> {
    records: Arc<Mutex<HashMap<RequestId, R>>>,
}

impl<R> Clone for Processes<R> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
        }
    }
}

impl<R> Default for Processes<R> {
    fn default() -> Self {
        Self {
            records: Default::default(),
        }
    }
}

impl<R: Record> Processes<R> {
    /// Stores `record` unless a record for `id` exists.
    ///
    /// Returns the existing record in that case.
    pub fn admit(&self, id: RequestId, record: R) -> Option<R> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(&id) {
            return Some(existing.clone());
        }
        records.insert(id, record);
        None
    }

    /// The record for `id`.
    pub fn get(&self, id: &RequestId) -> Option<R> {
        self.records.lock().get(id).cloned()
    }

    /// Applies `f` to the record for `id`, if present.
    pub fn update(&self, id: &RequestId, f: impl FnOnce(&mut R)) {
        if let Some(record) = self.records.lock().get_mut(id) {
            f(record);
        }
    }

    /// Removes the record for `id`.
    pub fn remove(&self, id: &RequestId) -> Option<R> {
        self.records.lock().remove(id)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether there are no live records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Answers a status check.
    pub fn check(&self, interest: &Interest) -> R {
        if !interest.has_valid_params_digest() {
            return R::bare(None, StatusCode::Malformed);
        }
        let params = interest.app_params.as_deref().unwrap_or_default();
        match postcard::from_bytes::<StatusQuery>(params) {
            Ok(query) => self
                .get(&query.request_no)
                .unwrap_or_else(|| R::bare(Some(query.request_no), StatusCode::NotFound)),
            Err(err) => {
                debug!(?err, "undecodable status query");
                R::bare(None, StatusCode::Malformed)
            }
        }
    }

    /// Answers a status check with a data object carrying the encoded record.
    pub fn check_data(&self, interest: &Interest) -> Option<Data> {
        let record = self.check(interest);
        match postcard::to_stdvec(&record) {
            Ok(content) => Some(Data::new(interest.name.clone(), content)),
            Err(err) => {
                warn!(?err, "failed to encode status");
                None
            }
        }
    }
}

/// What the insert and delete handlers share.
#[derive(Debug, Clone)]
pub struct HandlerContext<T> {
    /// Transport to fetch objects with.
    pub transport: T,
    /// Cache objects are written through.
    pub cache: Cache,
    /// Read prefix registry.
    pub prefixes: ReadPrefixes<T>,
    /// Name of the repository.
    pub repo_name: Name,
    /// Whether the repository serves the whole namespace.
    pub register_root: bool,
    /// Fetch settings.
    pub fetch: FetchConfig,
    /// Cancels all running processes.
    pub shutdown: CancellationToken,
}

/// Responder answering status checks from `processes`.
pub fn check_responder<R: Record>(processes: &Processes<R>) -> Responder {
    let processes = processes.clone();
    responder(move |interest: Interest| {
        let data = processes.check_data(&interest);
        async move { data }
    })
}

/// Keeps the finished record `id` queryable for `grace`, then drops it.
async fn retire<R: Record>(processes: &Processes<R>, id: RequestId, grace: Duration) {
    tokio::time::sleep(grace).await;
    processes.remove(&id);
    trace!(id = %id.fmt_short(), "process record expired");
}

/// Number of ids in `start..=end`, `None` if it does not fit a `u64`.
fn range_len(start: u64, end: u64) -> Option<u64> {
    end.checked_sub(start)?.checked_add(1)
}

/// Why a command was rejected as malformed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The payload is not an encoded command.
    #[error("undecodable command: {0}")]
    Decode(#[from] postcard::Error),
    /// The command is structurally inconsistent.
    #[error("invalid command: {0}")]
    Invalid(String),
}

/// Decodes and validates a command, computing its request id.
fn accept<C: DeserializeOwned>(
    payload: &[u8],
    validate: impl FnOnce(&C) -> Result<(), String>,
) -> Result<(RequestId, C), CommandError> {
    let command: C = postcard::from_bytes(payload)?;
    validate(&command).map_err(CommandError::Invalid)?;
    Ok((RequestId::of(payload), command))
}

/// Reference counted registrations of additional check prefixes.
#[derive(Debug)]
struct CheckRoutes<T> {
    transport: T,
    routes: Arc<Mutex<HashMap<Name, usize>>>,
}

impl<T: Clone> Clone for CheckRoutes<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            routes: self.routes.clone(),
        }
    }
}

impl<T: Transport> CheckRoutes<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            routes: Default::default(),
        }
    }

    fn acquire(&self, prefix: &Name, responder: Responder) -> Result<()> {
        let mut routes = self.routes.lock();
        let count = routes.entry(prefix.clone()).or_default();
        if *count == 0 {
            self.transport.register(prefix.clone(), responder)?;
        }
        *count += 1;
        Ok(())
    }

    fn release(&self, prefix: &Name) {
        let mut routes = self.routes.lock();
        if let Some(count) = routes.get_mut(prefix) {
            *count -= 1;
            if *count == 0 {
                routes.remove(prefix);
                self.transport.unregister(prefix);
            }
        }
    }

    fn clear(&self) {
        for (prefix, _) in self.routes.lock().drain() {
            self.transport.unregister(&prefix);
        }
    }
}
