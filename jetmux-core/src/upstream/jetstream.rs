//! Jetstream WebSocket client.
//!
//! The client owns one background reader task per connection session:
//! - reads text frames and decodes them into posts;
//! - publishes posts on a broadcast channel and status on a watch channel;
//! - on an unexpected close, reconnects with exponential backoff, resuming
//!   from the last seen `time_us` cursor so no posts are skipped;
//! - gives up after `max_reconnect_attempts` consecutive failures and
//!   reports [`ConnectionStatus::Error`].
//!
//! The broadcast and watch senders live as long as the client, so
//! subscriptions survive reconnects.

use super::{PostTransport, TransportError};
use crate::utils::backoff::reconnect_delay_with_jitter;
use async_trait::async_trait;
use futures_util::StreamExt;
use jetmux_sdk::objects::jetstream::{JetstreamEvent, POST_COLLECTION};
use jetmux_sdk::{ConnectionStatus, Post, TransportMetrics};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Public Jetstream instance operated by Bluesky.
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Default capacity of the post broadcast channel.
///
/// A subscriber that falls further behind than this loses the oldest posts
/// and is told how many it skipped.
pub const DEFAULT_POST_CHANNEL_CAPACITY: usize = 4096;

const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    /// Subscribe endpoint, without query parameters.
    pub url: Url,
    pub wanted_collections: Vec<String>,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_reconnect_attempts: u32,
    pub channel_capacity: usize,
}

impl JetstreamConfig {
    /// Default settings against the public Bluesky instance.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_endpoint(DEFAULT_JETSTREAM_URL)
    }

    /// Default settings against a custom endpoint.
    pub fn with_endpoint(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: Url::parse(url)?,
            wanted_collections: vec![POST_COLLECTION.to_string()],
            max_reconnect_attempts: 10,
            channel_capacity: DEFAULT_POST_CHANNEL_CAPACITY,
        })
    }
}

/// [`PostTransport`] backed by a Jetstream WebSocket.
pub struct JetstreamClient {
    inner: Arc<ClientInner>,
    session: Mutex<Option<Session>>,
}

struct Session {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ClientInner {
    config: JetstreamConfig,
    posts_tx: broadcast::Sender<Post>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Last seen `time_us`; 0 when there is nothing to resume from.
    cursor: AtomicI64,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    posts_processed: AtomicU64,
    reconnect_attempts: AtomicU32,
    /// Unix milliseconds of the last metrics reset.
    since_ms: AtomicI64,
}

enum ReadOutcome {
    Stopped,
    Closed(String),
}

impl JetstreamClient {
    pub fn new(config: JetstreamConfig) -> Self {
        let (posts_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let counters = Counters::default();
        counters.since_ms.store(now_ms(), Ordering::Relaxed);
        Self {
            inner: Arc::new(ClientInner {
                config,
                posts_tx,
                status_tx,
                cursor: AtomicI64::new(0),
                counters,
            }),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PostTransport for JetstreamClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            debug!("Jetstream already connected");
            return Ok(());
        }

        self.inner.set_status(ConnectionStatus::Connecting);
        let stream = match self.inner.open().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to connect to Jetstream");
                self.inner.set_status(ConnectionStatus::Error);
                return Err(e);
            }
        };
        self.inner.set_status(ConnectionStatus::Connected);
        info!(url = %self.inner.config.url, "Connected to Jetstream");

        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(stream, stop_rx).await });
        *session = Some(Session { stop_tx, task });
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(Session { stop_tx, mut task }) = session {
            let _ = stop_tx.send(true);
            if tokio::time::timeout(SESSION_STOP_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("Jetstream reader did not stop in time, aborting");
                task.abort();
            }
            info!("Disconnected from Jetstream");
        }
        // A later connect serves a new set of jobs and must not replay.
        self.inner.cursor.store(0, Ordering::Relaxed);
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    fn reset_metrics(&self) {
        let counters = &self.inner.counters;
        counters.messages_received.store(0, Ordering::Relaxed);
        counters.posts_processed.store(0, Ordering::Relaxed);
        counters.reconnect_attempts.store(0, Ordering::Relaxed);
        counters.since_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn subscribe_posts(&self) -> broadcast::Receiver<Post> {
        self.inner.posts_tx.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    fn metrics(&self) -> TransportMetrics {
        let counters = &self.inner.counters;
        let messages_received = counters.messages_received.load(Ordering::Relaxed);
        let elapsed_secs =
            (now_ms() - counters.since_ms.load(Ordering::Relaxed)).max(1) as f64 / 1000.0;
        TransportMetrics {
            messages_received,
            messages_per_second: messages_received as f64 / elapsed_secs,
            posts_processed: counters.posts_processed.load(Ordering::Relaxed),
            connection_status: *self.inner.status_tx.borrow(),
            reconnect_attempts: counters.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl ClientInner {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Jetstream status changed");
        }
    }

    fn subscribe_url(&self) -> Url {
        let mut url = self.config.url.clone();
        {
            let mut query = url.query_pairs_mut();
            for collection in &self.config.wanted_collections {
                query.append_pair("wantedCollections", collection);
            }
            let cursor = self.cursor.load(Ordering::Relaxed);
            if cursor > 0 {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }

    async fn open(&self) -> Result<WsStream, TransportError> {
        let url = self.subscribe_url();
        debug!(%url, "Opening Jetstream connection");
        let (stream, _response) = connect_async(url.as_str()).await?;
        Ok(stream)
    }

    /// Session loop: read until stopped, reconnecting on unexpected closes.
    async fn run(self: Arc<Self>, mut stream: WsStream, mut stop_rx: watch::Receiver<bool>) {
        loop {
            match self.read_until_closed(&mut stream, &mut stop_rx).await {
                ReadOutcome::Stopped => {
                    let _ = stream.close(None).await;
                    return;
                }
                ReadOutcome::Closed(reason) => {
                    warn!(%reason, "Jetstream connection lost");
                }
            }

            match self.reconnect(&mut stop_rx).await {
                Some(reopened) => stream = reopened,
                None => return,
            }
        }
    }

    async fn read_until_closed(
        &self,
        stream: &mut WsStream,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => return ReadOutcome::Stopped,

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Binary(bytes))) => {
                        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                        trace!(len = bytes.len(), "Ignoring binary Jetstream frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return ReadOutcome::Closed(format!("closed by server: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ReadOutcome::Closed(e.to_string()),
                    None => return ReadOutcome::Closed("stream ended".to_string()),
                },
            }
        }
    }

    /// Returns `None` when stopped or when the attempts are exhausted.
    async fn reconnect(&self, stop_rx: &mut watch::Receiver<bool>) -> Option<WsStream> {
        let max_attempts = self.config.max_reconnect_attempts;
        for attempt in 0..max_attempts {
            self.set_status(ConnectionStatus::Reconnecting);
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = reconnect_delay_with_jitter(attempt);
            info!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to Jetstream"
            );

            tokio::select! {
                biased;
                _ = stop_rx.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                biased;
                _ = stop_rx.changed() => return None,
                opened = self.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    self.set_status(ConnectionStatus::Connected);
                    info!(attempt = attempt + 1, "Reconnected to Jetstream");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Jetstream reconnect failed");
                }
            }
        }

        error!(max_attempts, "Giving up on Jetstream after repeated reconnect failures");
        self.set_status(ConnectionStatus::Error);
        None
    }

    fn handle_frame(&self, text: &str) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let event = match JetstreamEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Undecodable Jetstream frame");
                return;
            }
        };
        self.cursor.store(event.time_us, Ordering::Relaxed);

        match event.into_post() {
            Ok(post) => {
                self.counters.posts_processed.fetch_add(1, Ordering::Relaxed);
                // No receivers simply means nobody is listening right now.
                let _ = self.posts_tx.send(post);
            }
            Err(e) => trace!(reason = %e, "Skipping non-post Jetstream frame"),
        }
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
