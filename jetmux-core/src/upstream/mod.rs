//! Upstream collaborators of the router.
//!
//! The router consumes two external services through the traits below:
//!
//! - [`PostTransport`]: the shared firehose connection, with its own
//!   reconnect policy;
//! - [`HandleResolver`]: DID-to-handle resolution, expected to cache.
//!
//! [`JetstreamClient`] and [`BskyHandleResolver`] are the production
//! implementations.

pub mod handle_resolver;
pub mod jetstream;

pub use handle_resolver::{BskyHandleResolver, ResolverConfig};
pub use jetstream::{JetstreamClient, JetstreamConfig};

use async_trait::async_trait;
use jetmux_sdk::{ConnectionStatus, Post, ResolverMetrics, TransportMetrics};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Errors raised by a [`PostTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket handshake or protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Endpoint URL could not be built
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The transport refused or could not reach the upstream
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Shared connection to the post firehose.
///
/// Subscriptions outlive individual connections: a receiver obtained before
/// `connect` keeps receiving across reconnects until the transport is
/// dropped.
#[async_trait]
pub trait PostTransport: Send + Sync {
    /// Open the connection. Returns once the first handshake has completed
    /// or failed. Calling it while already connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    fn reset_metrics(&self);

    fn subscribe_posts(&self) -> broadcast::Receiver<Post>;

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;

    fn metrics(&self) -> TransportMetrics;
}

/// Resolves author DIDs to display handles.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// Never fails: on any internal error the DID itself is returned.
    async fn resolve_handle(&self, did: &str) -> String;

    fn metrics(&self) -> ResolverMetrics;
}
