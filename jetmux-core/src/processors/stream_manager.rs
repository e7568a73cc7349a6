//! Stream manager.
//!
//! Owns the lifecycle of the shared firehose connection: it connects when
//! the first job is registered and disconnects when the last active job
//! leaves, whichever way it leaves. While listening, every post received
//! from the transport is matched against the registry and handed to the
//! [`KeywordFilter`] for dispatch.
//!
//! All connect and disconnect transitions are serialized by one lifecycle
//! lock. The lock is never held while a sink runs.

use super::keyword_filter::{KeywordFilter, MatchStats};
use crate::registry::{JobConfig, JobRegistry, JobSink, JobSummary, SinkError};
use crate::upstream::{HandleResolver, PostTransport, TransportError};
use async_trait::async_trait;
use jetmux_sdk::{ConnectionStatus, JobId, MatchedMessage, Post, ResolverMetrics, TransportMetrics};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StreamError {
    /// The transport could not be opened for the first job
    #[error("failed to connect to the post stream: {0}")]
    Connect(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Period of the metrics log line while listening.
    pub metrics_interval: Duration,
    /// Upper bound on posts being dispatched concurrently.
    pub max_in_flight_posts: usize,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(30),
            max_in_flight_posts: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub listening: bool,
    pub connection_status: ConnectionStatus,
    pub active_jobs: usize,
    pub jobs: Vec<JobSummary>,
    pub transport: TransportMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub posts_processed: u64,
    pub posts_matched: u64,
    /// Sum over posts of the number of jobs each post matched.
    pub job_matches: u64,
    /// `posts_matched / posts_processed`, `0.0` before the first post.
    pub match_rate: f64,
    pub filter: MatchStats,
    pub transport: TransportMetrics,
    pub resolver: ResolverMetrics,
}

#[derive(Default)]
struct StreamCounters {
    posts_processed: AtomicU64,
    posts_matched: AtomicU64,
    job_matches: AtomicU64,
}

impl StreamCounters {
    fn reset(&self) {
        self.posts_processed.store(0, Ordering::Relaxed);
        self.posts_matched.store(0, Ordering::Relaxed);
        self.job_matches.store(0, Ordering::Relaxed);
    }
}

struct Listener {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Shared handle to the stream manager.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: JobRegistry,
    filter: Arc<KeywordFilter>,
    transport: Arc<dyn PostTransport>,
    config: StreamManagerConfig,
    /// `Some` while listening.
    lifecycle: Mutex<Option<Listener>>,
    listening: AtomicBool,
    counters: Arc<StreamCounters>,
}

/// Wraps a job's sink so that the manager gets a chance to release the
/// connection after the job completes or times out.
struct AutoReleaseSink {
    sink: Arc<dyn JobSink>,
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl JobSink for AutoReleaseSink {
    async fn on_data(&self, message: MatchedMessage) -> Result<(), SinkError> {
        self.sink.on_data(message).await
    }

    async fn on_complete(&self, matched_count: u64) {
        self.sink.on_complete(matched_count).await;
        if let Some(manager) = self.manager.upgrade() {
            manager.release_if_idle().await;
        }
    }
}

impl StreamManager {
    pub fn new(
        registry: JobRegistry,
        transport: Arc<dyn PostTransport>,
        resolver: Arc<dyn HandleResolver>,
        config: StreamManagerConfig,
    ) -> Self {
        let filter = Arc::new(KeywordFilter::new(registry.clone(), resolver));
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                filter,
                transport,
                config,
                lifecycle: Mutex::new(None),
                listening: AtomicBool::new(false),
                counters: Arc::new(StreamCounters::default()),
            }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn filter(&self) -> &KeywordFilter {
        &self.inner.filter
    }

    /// Register a job and start listening if it is the first one.
    ///
    /// If the connection cannot be opened the job is unregistered again and
    /// the manager stays idle.
    #[tracing::instrument(skip_all, err, fields(job_id = %config.job_id, correlation_id = %config.correlation_id))]
    pub async fn register_job(&self, config: JobConfig) -> Result<(), StreamError> {
        let job_id = config.job_id.clone();
        let sink: Arc<dyn JobSink> = Arc::new(AutoReleaseSink {
            sink: config.sink,
            manager: Arc::downgrade(&self.inner),
        });
        let config = JobConfig { sink, ..config };

        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.registry.register_job(config).await;
        if lifecycle.is_some() {
            return Ok(());
        }

        if let Err(e) = self.inner.start_listening(&mut lifecycle).await {
            self.inner.registry.unregister_job(&job_id).await;
            warn!("Rolled back job registration after connect failure");
            return Err(e);
        }
        Ok(())
    }

    /// Complete a job: its sink gets `on_complete` with the final count and
    /// the connection is released if no jobs remain.
    ///
    /// Returns `false` if the job is not active.
    pub async fn complete_job(&self, job_id: &JobId) -> bool {
        match self.inner.registry.complete_job(job_id).await {
            Some(matched_count) => {
                info!(%job_id, matched_count, "Completed job");
                true
            }
            None => {
                warn!(%job_id, "Cannot complete unknown job");
                false
            }
        }
    }

    /// Cancel a job without notifying its sink.
    ///
    /// Returns `false` if the job is not active.
    pub async fn cancel_job(&self, job_id: &JobId) -> bool {
        if !self.inner.registry.unregister_job(job_id).await {
            warn!(%job_id, "Cannot cancel unknown job");
            return false;
        }
        info!(%job_id, "Cancelled job");
        self.inner.release_if_idle().await;
        true
    }

    pub async fn is_job_registered(&self, job_id: &JobId) -> bool {
        self.inner.registry.has_job(job_id).await
    }

    /// Stop listening and close the connection. Idempotent.
    ///
    /// Active jobs stay registered; they receive nothing until the next
    /// [`reconnect`](Self::reconnect).
    pub async fn stop_listening(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.stop_locked(&mut lifecycle).await;
    }

    /// Close the connection and reopen it if any job is still active.
    ///
    /// This is the only way to recover after the transport gave up
    /// reconnecting on its own.
    pub async fn reconnect(&self) -> Result<(), StreamError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        info!("Reconnecting to the post stream");
        self.inner.stop_locked(&mut lifecycle).await;

        if !self.inner.registry.has_active_jobs().await {
            info!("No active jobs, staying disconnected");
            return Ok(());
        }
        self.inner.start_listening(&mut lifecycle).await
    }

    pub async fn status(&self) -> ManagerStatus {
        let jobs: Vec<JobSummary> = self
            .inner
            .registry
            .get_active_jobs()
            .await
            .iter()
            .map(JobSummary::from)
            .collect();
        let transport = self.inner.transport.metrics();
        ManagerStatus {
            listening: self.inner.listening.load(Ordering::Acquire),
            connection_status: transport.connection_status,
            active_jobs: jobs.len(),
            jobs,
            transport,
        }
    }

    pub async fn stats(&self) -> StreamStats {
        let counters = &self.inner.counters;
        let posts_processed = counters.posts_processed.load(Ordering::Relaxed);
        let posts_matched = counters.posts_matched.load(Ordering::Relaxed);
        let match_rate = if posts_processed == 0 {
            0.0
        } else {
            posts_matched as f64 / posts_processed as f64
        };
        StreamStats {
            posts_processed,
            posts_matched,
            job_matches: counters.job_matches.load(Ordering::Relaxed),
            match_rate,
            filter: self.inner.filter.match_stats().await,
            transport: self.inner.transport.metrics(),
            resolver: self.inner.filter.resolver_metrics(),
        }
    }

    /// Zero the manager, filter and transport counters. Per-job matched
    /// counts are left alone.
    pub fn reset_stats(&self) {
        self.inner.counters.reset();
        self.inner.filter.reset_stats();
        self.inner.transport.reset_metrics();
        debug!("Reset stream statistics");
    }

    /// Complete every active job, then stop listening.
    pub async fn shutdown(&self) {
        let jobs = self.inner.registry.get_active_jobs().await;
        info!(active_jobs = jobs.len(), "Shutting down stream manager");
        for job in jobs {
            self.inner.registry.complete_job(&job.job_id).await;
        }
        self.stop_listening().await;
    }
}

impl ManagerInner {
    /// Subscribe, spawn the listener and open the transport.
    ///
    /// On failure the listener is torn down again and the transport is
    /// closed, leaving everything idle.
    async fn start_listening(&self, lifecycle: &mut Option<Listener>) -> Result<(), StreamError> {
        let posts_rx = self.transport.subscribe_posts();
        let status_rx = self.transport.subscribe_status();
        let (stop_tx, stop_rx) = watch::channel(false);

        let context = ListenerContext {
            registry: self.registry.clone(),
            filter: Arc::clone(&self.filter),
            transport: Arc::clone(&self.transport),
            counters: Arc::clone(&self.counters),
            permits: Arc::new(Semaphore::new(self.config.max_in_flight_posts.max(1))),
            metrics_interval: self.config.metrics_interval,
        };
        let task = tokio::spawn(context.run(posts_rx, status_rx, stop_rx));

        if let Err(e) = self.transport.connect().await {
            error!(error = %e, "Failed to start listening");
            let _ = stop_tx.send(true);
            let _ = task.await;
            self.transport.disconnect().await;
            return Err(e.into());
        }

        *lifecycle = Some(Listener { stop_tx, task });
        self.listening.store(true, Ordering::Release);
        info!("Started listening to the post stream");
        Ok(())
    }

    /// Returns whether there was anything to stop.
    async fn stop_locked(&self, lifecycle: &mut Option<Listener>) -> bool {
        let Some(listener) = lifecycle.take() else {
            return false;
        };
        let _ = listener.stop_tx.send(true);
        if let Err(e) = listener.task.await {
            warn!(error = %e, "Listener task ended abnormally");
        }
        self.transport.disconnect().await;
        self.listening.store(false, Ordering::Release);
        info!("Stopped listening to the post stream");
        true
    }

    async fn release_if_idle(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.registry.has_active_jobs().await {
            return;
        }
        if self.stop_locked(&mut lifecycle).await {
            info!("No active jobs remain, released the post stream");
        }
    }
}

struct ListenerContext {
    registry: JobRegistry,
    filter: Arc<KeywordFilter>,
    transport: Arc<dyn PostTransport>,
    counters: Arc<StreamCounters>,
    permits: Arc<Semaphore>,
    metrics_interval: Duration,
}

impl ListenerContext {
    async fn run(
        self,
        mut posts_rx: broadcast::Receiver<Post>,
        mut status_rx: watch::Receiver<ConnectionStatus>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        debug!("Listener started");
        let mut metrics_tick = tokio::time::interval(self.metrics_interval);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        metrics_tick.tick().await;
        let mut status_open = true;

        loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    debug!("Listener received stop signal");
                    break;
                }

                changed = status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = *status_rx.borrow_and_update();
                    match status {
                        ConnectionStatus::Error => {
                            error!(%status, "Post stream failed, waiting for an explicit reconnect");
                        }
                        ConnectionStatus::Reconnecting => warn!(%status, "Post stream reconnecting"),
                        _ => info!(%status, "Post stream status changed"),
                    }
                }

                received = posts_rx.recv() => match received {
                    Ok(post) => {
                        if !self.handle_post(post, &mut stop_rx).await {
                            debug!("Listener received stop signal while waiting for a dispatch slot");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Listener lagged behind the post stream, posts dropped");
                    }
                    Err(RecvError::Closed) => {
                        error!("Post stream closed");
                        break;
                    }
                },

                _ = metrics_tick.tick() => self.log_metrics().await,
            }
        }
        debug!("Listener stopped");
    }

    /// Match synchronously, dispatch in the background.
    ///
    /// Returns `false` when a stop arrived while every dispatch slot was
    /// taken; the post is dropped.
    async fn handle_post(&self, post: Post, stop_rx: &mut watch::Receiver<bool>) -> bool {
        self.counters.posts_processed.fetch_add(1, Ordering::Relaxed);
        let matched = self.filter.match_post(&post).await;
        if matched.is_empty() {
            return true;
        }

        let permit = tokio::select! {
            biased;

            _ = stop_rx.changed() => return false,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return true,
            },
        };
        let filter = Arc::clone(&self.filter);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let dispatched = filter.dispatch(post, matched).await;
            counters.posts_matched.fetch_add(1, Ordering::Relaxed);
            counters.job_matches.fetch_add(dispatched as u64, Ordering::Relaxed);
            drop(permit);
        });
        true
    }

    async fn log_metrics(&self) {
        let transport = self.transport.metrics();
        let resolver = self.filter.resolver_metrics();
        let active_jobs = self.registry.active_job_count().await;
        info!(
            active_jobs,
            posts_processed = self.counters.posts_processed.load(Ordering::Relaxed),
            posts_matched = self.counters.posts_matched.load(Ordering::Relaxed),
            job_matches = self.counters.job_matches.load(Ordering::Relaxed),
            messages_received = transport.messages_received,
            messages_per_second = transport.messages_per_second,
            connection_status = %transport.connection_status,
            reconnect_attempts = transport.reconnect_attempts,
            resolver_hit_rate = resolver.hit_rate,
            resolver_cache_size = resolver.cache_size,
            "Stream metrics"
        );
    }
}
