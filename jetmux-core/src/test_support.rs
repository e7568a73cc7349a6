//! Test doubles shared by the unit tests of this crate.

use crate::registry::{JobSink, SinkError};
use crate::upstream::{HandleResolver, PostTransport, TransportError};
use async_trait::async_trait;
use jetmux_sdk::{ConnectionStatus, MatchedMessage, Post, ResolverMetrics, TransportMetrics};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, broadcast, watch};

pub fn post(text: &str) -> Post {
    Post {
        did: "did:plc:author".to_string(),
        handle: None,
        text: text.to_string(),
        uri: "at://did:plc:author/app.bsky.feed.post/3kpost".to_string(),
        rkey: "3kpost".to_string(),
        created_at: time::OffsetDateTime::UNIX_EPOCH,
    }
}

/// Sink that records everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<MatchedMessage>>,
    completions: Mutex<Vec<u64>>,
    fail: AtomicBool,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink whose `on_data` always fails.
    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn messages(&self) -> Vec<MatchedMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<u64> {
        self.completions.lock().unwrap().clone()
    }

    pub async fn wait_messages(&self, count: usize, within: Duration) {
        let _ = tokio::time::timeout(within, async {
            while self.messages.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        })
        .await;
    }

    pub async fn wait_completed(&self, within: Duration) {
        let _ = tokio::time::timeout(within, async {
            while self.completions.lock().unwrap().is_empty() {
                self.notify.notified().await;
            }
        })
        .await;
    }
}

#[async_trait]
impl JobSink for RecordingSink {
    async fn on_data(&self, message: MatchedMessage) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            self.notify.notify_one();
            return Err("sink rejected message".into());
        }
        self.messages.lock().unwrap().push(message);
        self.notify.notify_one();
        Ok(())
    }

    async fn on_complete(&self, matched_count: u64) {
        self.completions.lock().unwrap().push(matched_count);
        self.notify.notify_one();
    }
}

/// Sink whose `on_data` waits until the test releases it.
pub struct GatedSink {
    gate: Semaphore,
    entered: AtomicU32,
    delivered: AtomicU32,
    notify: Notify,
}

impl GatedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            entered: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    /// Messages that reached `on_data`, released or not.
    pub fn entered(&self) -> u32 {
        self.entered.load(Ordering::SeqCst)
    }

    /// Messages that were released and accepted.
    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Let `count` blocked or future messages through.
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub async fn wait_entered(&self, count: u32, within: Duration) {
        let _ = tokio::time::timeout(within, async {
            while self.entered() < count {
                self.notify.notified().await;
            }
        })
        .await;
    }
}

#[async_trait]
impl JobSink for GatedSink {
    async fn on_data(&self, _message: MatchedMessage) -> Result<(), SinkError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        self.gate.acquire().await?.forget();
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_complete(&self, _matched_count: u64) {}
}

/// Sink that panics on every message.
pub struct PanickingSink;

#[async_trait]
impl JobSink for PanickingSink {
    async fn on_data(&self, _message: MatchedMessage) -> Result<(), SinkError> {
        panic!("sink exploded");
    }

    async fn on_complete(&self, _matched_count: u64) {}
}

/// Resolver that maps every DID to `{did}.test` and counts calls.
#[derive(Default)]
pub struct MockResolver {
    pub calls: AtomicU64,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleResolver for MockResolver {
    async fn resolve_handle(&self, did: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{}.test", did.trim_start_matches("did:plc:"))
    }

    fn metrics(&self) -> ResolverMetrics {
        ResolverMetrics {
            cache_misses: self.calls(),
            ..Default::default()
        }
    }
}

/// Scripted transport: counts lifecycle calls and lets tests inject posts.
pub struct MockTransport {
    posts_tx: broadcast::Sender<Post>,
    status_tx: watch::Sender<ConnectionStatus>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    metric_resets: AtomicU32,
    fail_connect: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (posts_tx, _) = broadcast::channel(64);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            posts_tx,
            status_tx,
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            metric_resets: AtomicU32::new(0),
            fail_connect: AtomicBool::new(false),
        })
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn metric_resets(&self) -> u32 {
        self.metric_resets.load(Ordering::SeqCst)
    }

    pub fn send_post(&self, post: Post) {
        let _ = self.posts_tx.send(post);
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }
}

#[async_trait]
impl PostTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            self.set_status(ConnectionStatus::Error);
            return Err(TransportError::Unavailable("scripted failure".to_string()));
        }
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn reset_metrics(&self) {
        self.metric_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_posts(&self) -> broadcast::Receiver<Post> {
        self.posts_tx.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            connection_status: *self.status_tx.borrow(),
            ..Default::default()
        }
    }
}
