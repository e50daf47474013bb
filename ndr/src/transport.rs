//! Request/response transport used by the repository.
//!
//! The repository is transport agnostic: it expresses [`Interest`]s and serves data by
//! registering [`Responder`]s under name prefixes. [`mem`] provides an in-process
//! forwarder connecting any number of endpoints.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use ndr_base::{name::TYPE_PARAMETERS_DIGEST, Component, Data, Name};

pub mod mem;

/// Default lifetime of an interest.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(4);

/// A request for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    /// Requested name.
    pub name: Name,
    /// Whether data under a longer name may satisfy the request.
    pub can_be_prefix: bool,
    /// Whether only fresh data may satisfy the request.
    pub must_be_fresh: bool,
    /// How long the requester waits for data.
    pub lifetime: Duration,
    /// Hint for reaching the producer.
    pub forwarding_hint: Option<Name>,
    /// Application parameters.
    pub app_params: Option<Bytes>,
}

impl Interest {
    /// Creates an interest for exactly `name`.
    pub fn new(name: Name) -> Self {
        Self {
            name,
            can_be_prefix: false,
            must_be_fresh: false,
            lifetime: DEFAULT_LIFETIME,
            forwarding_hint: None,
            app_params: None,
        }
    }

    /// Creates an interest carrying `params`, addressed to `name` followed by the
    /// parameters digest.
    pub fn with_params(name: &Name, params: impl Into<Bytes>) -> Self {
        let params = params.into();
        let digest = blake3::hash(&params);
        let mut interest = Self::new(name.append(Component::parameters_digest(*digest.as_bytes())));
        interest.app_params = Some(params);
        interest
    }

    /// Sets whether longer names may satisfy the interest.
    pub fn can_be_prefix(mut self, can_be_prefix: bool) -> Self {
        self.can_be_prefix = can_be_prefix;
        self
    }

    /// Sets whether the data must be fresh.
    pub fn must_be_fresh(mut self, must_be_fresh: bool) -> Self {
        self.must_be_fresh = must_be_fresh;
        self
    }

    /// Sets the lifetime.
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the forwarding hint.
    pub fn forwarding_hint(mut self, hint: Option<Name>) -> Self {
        self.forwarding_hint = hint;
        self
    }

    /// Whether the name ends in a digest that matches the application parameters.
    pub fn has_valid_params_digest(&self) -> bool {
        let (Some(params), Some(last)) = (&self.app_params, self.name.last()) else {
            return false;
        };
        last.typ() == TYPE_PARAMETERS_DIGEST
            && last.value().as_ref() == blake3::hash(params).as_bytes()
    }

    /// The name without a trailing parameters digest.
    pub fn name_without_digest(&self) -> Name {
        match self.name.last() {
            Some(last) if last.typ() == TYPE_PARAMETERS_DIGEST => {
                self.name.prefix(self.name.len() - 1)
            }
            _ => self.name.clone(),
        }
    }

    /// Whether `data` satisfies this interest.
    pub fn matches(&self, data: &Data) -> bool {
        if self.can_be_prefix {
            self.name.is_prefix_of(&data.name)
        } else {
            self.name == data.name
        }
    }
}

/// Reason for a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum NackReason {
    /// No route towards the name.
    NoRoute,
    /// The path is congested.
    Congestion,
    /// The request was a duplicate.
    Duplicate,
}

/// Failure of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The network answered with a negative acknowledgement.
    #[error("negative acknowledgement: {0}")]
    Nack(NackReason),
    /// No data arrived within the interest lifetime.
    #[error("request timed out")]
    Timeout,
    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,
}

/// Produces data for interests under a registered prefix.
///
/// Returning `None` means the responder has nothing for this interest.
pub type Responder = Arc<dyn Fn(Interest) -> BoxFuture<'static, Option<Data>> + Send + Sync>;

/// Wraps an async closure as a [`Responder`].
pub fn responder<F, Fut>(f: F) -> Responder
where
    F: Fn(Interest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Data>> + Send + 'static,
{
    Arc::new(move |interest| Box::pin(f(interest)))
}

/// The request/response primitive.
pub trait Transport: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Sends an interest and waits for the matching data.
    fn express(
        &self,
        interest: Interest,
    ) -> impl Future<Output = Result<Data, RequestError>> + Send;

    /// Sends an interest to every responder under its name, without waiting for data.
    fn multicast(&self, interest: Interest);

    /// Serves interests under `prefix` with `responder`, replacing an earlier registration
    /// of the same prefix by this endpoint.
    fn register(&self, prefix: Name, responder: Responder) -> Result<()>;

    /// Stops serving `prefix`. Returns whether it was registered.
    fn unregister(&self, prefix: &Name) -> bool;
}
