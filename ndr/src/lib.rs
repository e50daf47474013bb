//! A named-data repository.
//!
//! The repository fetches segmented objects on command, keeps them in a write-back cache
//! in front of durable storage and serves them by name. It also replicates the data of
//! sync groups by listening to state vector advertisements.
//!
//! Start with [`Repo::spawn`] on any [`Transport`](transport::Transport). The
//! [`transport::mem`] network connects repositories, producers and clients within one
//! process.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(ndr_docsrs, feature(doc_cfg))]

pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod fetch;
pub mod ingest;
#[cfg(feature = "metrics")]
#[cfg_attr(ndr_docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;
pub mod prefixes;
pub mod pubsub;
pub mod repo;
pub mod storage;
pub mod sync;
pub mod transport;

pub use ndr_base::{Component, Data, Name};

pub use self::{
    cache::Cache,
    command::{RequestId, StatusCode},
    config::RepoConfig,
    repo::Repo,
};
