//! Notify-then-fetch publish/subscribe on top of a [`Transport`].
//!
//! A publisher serves the message under `<publisher prefix>/msg/<nonce>` and sends a
//! notification interest to `<topic>/notify` carrying that name. Any one subscriber
//! acknowledges by answering the notification, then fetches the message. Delivery is at
//! most once: a notification that nobody answers is not retried.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use ndr_base::{Data, Name};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::transport::{responder, Interest, Transport};

/// How long a published message stays available after it was acknowledged.
const MSG_RETENTION: Duration = Duration::from_secs(10);
/// Lifetime of notification interests.
const NOTIFY_LIFETIME: Duration = Duration::from_secs(1);
/// Attempts a subscriber makes to fetch a notified message.
const FETCH_ATTEMPTS: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
struct NotifyParams {
    msg_name: Name,
}

/// Publish/subscribe endpoint.
#[derive(Debug, Clone)]
pub struct PubSub<T> {
    transport: T,
    prefix: Name,
    topics: Arc<Mutex<HashSet<Name>>>,
}

impl<T: Transport> PubSub<T> {
    /// Creates an endpoint that serves its published messages under `prefix`.
    pub fn new(transport: T, prefix: Name) -> Self {
        Self {
            transport,
            prefix,
            topics: Default::default(),
        }
    }

    /// Publishes `payload` on `topic`.
    ///
    /// Returns whether a subscriber acknowledged the notification.
    pub async fn publish(&self, topic: &Name, payload: impl Into<Bytes>) -> Result<bool> {
        let payload = payload.into();
        let nonce: u64 = rand::random();
        let msg_name = self
            .prefix
            .append_generic("msg")
            .append_generic(format!("{nonce:016x}"));

        let (served_tx, served_rx) = oneshot::channel();
        let served_tx = Arc::new(Mutex::new(Some(served_tx)));
        let msg = Data::new(msg_name.clone(), payload);
        self.transport.register(
            msg_name.clone(),
            responder(move |_| {
                if let Some(tx) = served_tx.lock().take() {
                    tx.send(()).ok();
                }
                let msg = msg.clone();
                async move { Some(msg) }
            }),
        )?;

        let params = postcard::to_stdvec(&NotifyParams {
            msg_name: msg_name.clone(),
        })?;
        let notify = Interest::with_params(&topic.append_generic("notify"), params)
            .lifetime(NOTIFY_LIFETIME);
        if let Err(err) = self.transport.express(notify).await {
            debug!(%topic, %err, "publish not acknowledged");
            self.transport.unregister(&msg_name);
            return Ok(false);
        }

        trace!(%topic, %msg_name, "publish acknowledged");
        let transport = self.transport.clone();
        tokio::spawn(async move {
            tokio::time::timeout(MSG_RETENTION, served_rx).await.ok();
            transport.unregister(&msg_name);
        });
        Ok(true)
    }

    /// Subscribes to `topic`, calling `handler` with every delivered payload.
    ///
    /// Fails if this endpoint is already subscribed to `topic`.
    pub fn subscribe<F>(&self, topic: &Name, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let mut topics = self.topics.lock();
        ensure!(!topics.contains(topic), "already subscribed to {topic}");
        let handler = Arc::new(handler);
        let transport = self.transport.clone();
        let notify_prefix = topic.append_generic("notify");
        let topic_name = topic.clone();
        self.transport
            .register(
                notify_prefix,
                responder(move |interest: Interest| {
                    let ack = on_notify(&transport, &topic_name, &interest, handler.clone());
                    async move { ack }
                }),
            )
            .context("failed to register notify prefix")?;
        topics.insert(topic.clone());
        Ok(())
    }

    /// Stops delivering messages on `topic`.
    pub fn unsubscribe(&self, topic: &Name) -> bool {
        self.topics.lock().remove(topic);
        self.transport.unregister(&topic.append_generic("notify"))
    }
}

/// Acknowledges a notification and fetches the message in the background.
fn on_notify<T: Transport>(
    transport: &T,
    topic: &Name,
    interest: &Interest,
    handler: Arc<dyn Fn(Bytes) + Send + Sync>,
) -> Option<Data> {
    if !interest.has_valid_params_digest() {
        warn!(%topic, name = %interest.name, "dropping notification without valid parameters");
        return None;
    }
    let params = interest.app_params.as_deref().unwrap_or_default();
    let params: NotifyParams = match postcard::from_bytes(params) {
        Ok(params) => params,
        Err(err) => {
            warn!(%topic, ?err, "dropping undecodable notification");
            return None;
        }
    };
    let transport = transport.clone();
    let topic = topic.clone();
    tokio::spawn(async move {
        for attempt in 1..=FETCH_ATTEMPTS {
            match transport.express(Interest::new(params.msg_name.clone())).await {
                Ok(msg) => {
                    trace!(%topic, msg_name = %params.msg_name, "message received");
                    handler(msg.content);
                    return;
                }
                Err(err) => {
                    debug!(%topic, attempt, %err, "failed to fetch published message");
                }
            }
        }
        warn!(%topic, msg_name = %params.msg_name, "giving up on published message");
    });
    Some(Data::new(interest.name.clone(), Bytes::new()))
}
