//! Shared types for jetmux.
//!
//! This crate holds the data that crosses component boundaries: the posts
//! decoded from the Jetstream firehose, the messages dispatched to job
//! sinks, and the metrics reported by the upstream collaborators. It has no
//! async runtime of its own.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod aturi;
pub mod objects;

pub use objects::{
    ConnectionStatus, JobId, MatchedMessage, MessageTemplate, Post, ResolverMetrics, Source,
    TransportMetrics,
};
