//! Named data objects.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::name::{Component, Name};

/// An immutable named data object.
///
/// `freshness` is how long after insertion the object may satisfy a request that
/// requires fresh data. A zero freshness means the object is stale immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// Full name of the object.
    pub name: Name,
    /// Payload.
    pub content: Bytes,
    /// Freshness period.
    pub freshness: Duration,
    /// Last component of the terminal segment, for segmented objects.
    pub final_block_id: Option<Component>,
}

impl Data {
    /// Creates a data object with zero freshness and no final block marker.
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            freshness: Duration::ZERO,
            final_block_id: None,
        }
    }

    /// Sets the freshness period.
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Sets the final block marker.
    pub fn with_final_block_id(mut self, final_block_id: Component) -> Self {
        self.final_block_id = Some(final_block_id);
        self
    }

    /// The numeric value of the final block marker, if present and numeric.
    pub fn final_block_number(&self) -> Option<u64> {
        self.final_block_id.as_ref().and_then(Component::to_number)
    }

    /// Whether this object is the terminal segment of its object.
    pub fn is_final_block(&self) -> bool {
        matches!((&self.final_block_id, self.name.last()), (Some(f), Some(l)) if f == l)
    }

    /// Serializes the object.
    pub fn encode(&self) -> Bytes {
        postcard::to_stdvec(self)
            .expect("serializing to a vec is infallible")
            .into()
    }

    /// Deserializes an object produced by [`Data::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
