//! Job registry.
//!
//! The registry owns the table of active search jobs: their compiled
//! keyword matchers, their duration timers and their sinks. It is the only
//! shared mutable job state in the router, so every read and write goes
//! through one `RwLock`, and no lock is held while a sink runs.
//!
//! A job leaves the table in exactly one of three ways:
//! - [`JobRegistry::complete_job`]: removed, `on_complete` is called;
//! - [`JobRegistry::unregister_job`]: removed, `on_complete` is not called;
//! - its duration timer fires: removed, `on_complete` is called with the
//!   count accumulated so far.
//!
//! In every case the timer is aborted inside the same critical section that
//! removes the entry.

pub mod keywords;

pub use keywords::{
    KeywordMatcher, Keywords, MAX_KEYWORDS, MIN_KEYWORD_LENGTH, build_keyword_matcher,
    extract_keywords,
};

use async_trait::async_trait;
use jetmux_sdk::{JobId, MatchedMessage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error returned by a sink that failed to accept a message.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of one job's matched posts.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Deliver one matched post. An error is logged by the router and the
    /// post is not counted towards the job's matched count.
    async fn on_data(&self, message: MatchedMessage) -> Result<(), SinkError>;

    /// Called once when the job is completed or times out. Not called when
    /// the job is cancelled.
    async fn on_complete(&self, matched_count: u64);
}

/// Everything needed to register a job.
#[derive(Clone)]
pub struct JobConfig {
    pub job_id: JobId,
    pub prompt: String,
    pub correlation_id: String,
    /// `None` means the job never times out.
    pub max_duration: Option<Duration>,
    pub sink: Arc<dyn JobSink>,
}

impl JobConfig {
    /// A job without a timeout whose correlation id equals its job id.
    pub fn new(job_id: impl Into<JobId>, prompt: impl Into<String>, sink: Arc<dyn JobSink>) -> Self {
        let job_id = job_id.into();
        Self {
            correlation_id: job_id.to_string(),
            job_id,
            prompt: prompt.into(),
            max_duration: None,
            sink,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// `0` disables the timeout.
    pub fn with_max_duration_ms(mut self, max_duration_ms: u64) -> Self {
        self.max_duration = (max_duration_ms > 0).then(|| Duration::from_millis(max_duration_ms));
        self
    }
}

impl std::fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConfig")
            .field("job_id", &self.job_id)
            .field("prompt", &self.prompt)
            .field("correlation_id", &self.correlation_id)
            .field("max_duration", &self.max_duration)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of an active job.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub prompt: String,
    pub keywords: Keywords,
    pub matcher: KeywordMatcher,
    pub correlation_id: String,
    pub started_at: OffsetDateTime,
    pub max_duration: Option<Duration>,
    pub matched_count: u64,
}

/// Serializable summary of a [`Job`] for status and stats reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub correlation_id: String,
    pub keywords: Vec<String>,
    pub matched_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// `0` when the job never times out.
    pub max_duration_ms: u64,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: job.correlation_id.clone(),
            keywords: job.keywords.to_vec(),
            matched_count: job.matched_count,
            started_at: job.started_at,
            max_duration_ms: job.max_duration_ms(),
        }
    }
}

impl Job {
    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration.map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

/// Whether `text` matches `job`'s keyword pattern.
pub fn matches_job(text: &str, job: &Job) -> bool {
    job.matcher.is_match(text)
}

/// A job selected by [`JobRegistry::match_text`], carrying what dispatch
/// needs without holding the registry lock.
#[derive(Clone)]
pub struct MatchedJob {
    pub job_id: JobId,
    pub correlation_id: String,
    pub sink: Arc<dyn JobSink>,
    /// Registration the match was made against.
    pub generation: u64,
}

struct JobEntry {
    job: Job,
    sink: Arc<dyn JobSink>,
    timer: Option<JoinHandle<()>>,
    /// Distinguishes this entry from a later one registered under the same
    /// id, so that a stale timer never expires its replacement.
    generation: u64,
}

impl JobEntry {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Shared handle to the job table.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Registration order is preserved; lookups are linear.
    jobs: RwLock<Vec<JobEntry>>,
    next_generation: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: RwLock::new(Vec::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register a job, replacing any active job with the same id.
    ///
    /// Keywords are extracted and compiled here, once. If the job has a
    /// maximum duration its timer is armed immediately.
    #[tracing::instrument(skip_all, fields(job_id = %config.job_id, correlation_id = %config.correlation_id))]
    pub async fn register_job(&self, config: JobConfig) {
        let keywords = extract_keywords(&config.prompt);
        let matcher = build_keyword_matcher(&keywords);
        if keywords.is_empty() {
            warn!(prompt = %config.prompt, "No keywords extracted from prompt, job will never match");
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            job_id: config.job_id.clone(),
            prompt: config.prompt,
            keywords,
            matcher,
            correlation_id: config.correlation_id,
            started_at: OffsetDateTime::now_utc(),
            max_duration: config.max_duration,
            matched_count: 0,
        };

        let mut jobs = self.inner.jobs.write().await;
        if let Some(pos) = jobs.iter().position(|e| e.job.job_id == config.job_id) {
            let mut previous = jobs.remove(pos);
            previous.abort_timer();
            info!(
                previous_matched_count = previous.job.matched_count,
                "Replacing existing job"
            );
        }

        let timer = config
            .max_duration
            .map(|duration| self.spawn_timer(config.job_id.clone(), generation, duration));

        info!(
            keywords = ?job.keywords,
            max_duration_ms = job.max_duration_ms(),
            active_jobs = jobs.len() + 1,
            "Job registered"
        );

        jobs.push(JobEntry {
            job,
            sink: config.sink,
            timer,
            generation,
        });
    }

    /// Remove a job without calling `on_complete`.
    ///
    /// Returns `false` if no such job was active.
    pub async fn unregister_job(&self, job_id: &JobId) -> bool {
        match self.remove(job_id).await {
            Some(entry) => {
                info!(
                    %job_id,
                    correlation_id = %entry.job.correlation_id,
                    matched_count = entry.job.matched_count,
                    "Job unregistered"
                );
                true
            }
            None => {
                debug!(%job_id, "Unregister requested for unknown job");
                false
            }
        }
    }

    /// Remove a job and call its `on_complete` with the final matched count.
    ///
    /// Returns the final count, or `None` if no such job was active.
    pub async fn complete_job(&self, job_id: &JobId) -> Option<u64> {
        let Some(entry) = self.remove(job_id).await else {
            debug!(%job_id, "Completion requested for unknown job");
            return None;
        };

        let matched_count = entry.job.matched_count;
        info!(
            %job_id,
            correlation_id = %entry.job.correlation_id,
            matched_count,
            "Job completed"
        );
        entry.sink.on_complete(matched_count).await;
        Some(matched_count)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Option<Job> {
        let jobs = self.inner.jobs.read().await;
        jobs.iter()
            .find(|e| &e.job.job_id == job_id)
            .map(|e| e.job.clone())
    }

    /// Snapshots of all active jobs in registration order.
    pub async fn get_active_jobs(&self) -> Vec<Job> {
        let jobs = self.inner.jobs.read().await;
        jobs.iter().map(|e| e.job.clone()).collect()
    }

    pub async fn has_active_jobs(&self) -> bool {
        !self.inner.jobs.read().await.is_empty()
    }

    pub async fn active_job_count(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    pub async fn has_job(&self, job_id: &JobId) -> bool {
        let jobs = self.inner.jobs.read().await;
        jobs.iter().any(|e| &e.job.job_id == job_id)
    }

    /// Bump a job's matched count, returning the new value. A missing job is
    /// a no-op.
    pub async fn increment_matched_count(&self, job_id: &JobId) -> Option<u64> {
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs.iter_mut().find(|e| &e.job.job_id == job_id)?;
        entry.job.matched_count += 1;
        Some(entry.job.matched_count)
    }

    /// Count a successful delivery for the registration `matched` was
    /// selected from. Returns `None` when that job has since been removed
    /// or replaced.
    pub async fn record_delivery(&self, matched: &MatchedJob) -> Option<u64> {
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs
            .iter_mut()
            .find(|e| e.job.job_id == matched.job_id && e.generation == matched.generation)?;
        entry.job.matched_count += 1;
        Some(entry.job.matched_count)
    }

    /// All jobs whose pattern matches `text`, in registration order.
    ///
    /// This is a linear scan over the active jobs.
    pub async fn match_text(&self, text: &str) -> Vec<MatchedJob> {
        let jobs = self.inner.jobs.read().await;
        jobs.iter()
            .filter(|e| matches_job(text, &e.job))
            .map(|e| MatchedJob {
                job_id: e.job.job_id.clone(),
                correlation_id: e.job.correlation_id.clone(),
                sink: Arc::clone(&e.sink),
                generation: e.generation,
            })
            .collect()
    }

    // -- Private helpers ----------------------------------------------------

    async fn remove(&self, job_id: &JobId) -> Option<JobEntry> {
        let mut jobs = self.inner.jobs.write().await;
        let pos = jobs.iter().position(|e| &e.job.job_id == job_id)?;
        let mut entry = jobs.remove(pos);
        entry.abort_timer();
        Some(entry)
    }

    fn spawn_timer(&self, job_id: JobId, generation: u64, duration: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            expire(registry, job_id, generation).await;
        })
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer expiry: runs on the timer's own task, so the handle is detached
/// rather than aborted.
async fn expire(registry: Weak<RegistryInner>, job_id: JobId, generation: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };

    let entry = {
        let mut jobs = inner.jobs.write().await;
        let Some(pos) = jobs
            .iter()
            .position(|e| e.job.job_id == job_id && e.generation == generation)
        else {
            return;
        };
        let mut entry = jobs.remove(pos);
        drop(entry.timer.take());
        entry
    };
    drop(inner);

    let matched_count = entry.job.matched_count;
    info!(
        %job_id,
        correlation_id = %entry.job.correlation_id,
        matched_count,
        max_duration_ms = entry.job.max_duration_ms(),
        "Job reached its maximum duration"
    );
    entry.sink.on_complete(matched_count).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    fn config(id: &str, prompt: &str, sink: &Arc<RecordingSink>) -> JobConfig {
        JobConfig::new(id, prompt, sink.clone())
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry
            .register_job(config("a", "bitcoin cryptocurrency", &sink).with_correlation_id("corr-a"))
            .await;

        let job = registry.get_job(&JobId::new("a")).await.unwrap();
        assert_eq!(job.keywords.as_slice(), ["bitcoin", "cryptocurrency"]);
        assert_eq!(job.correlation_id, "corr-a");
        assert_eq!(job.matched_count, 0);
        assert!(matches_job("I just bought bitcoin!", &job));
        assert!(registry.has_active_jobs().await);
        assert_eq!(registry.active_job_count().await, 1);
        assert!(registry.has_job(&JobId::new("a")).await);
        assert!(!registry.has_job(&JobId::new("b")).await);
    }

    #[tokio::test]
    async fn test_reregister_replaces_entry() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry.register_job(config("a", "bitcoin", &sink)).await;
        registry.increment_matched_count(&JobId::new("a")).await;
        registry.register_job(config("a", "ethereum", &sink)).await;

        assert_eq!(registry.active_job_count().await, 1);
        let job = registry.get_job(&JobId::new("a")).await.unwrap();
        assert_eq!(job.keywords.as_slice(), ["ethereum"]);
        assert_eq!(job.matched_count, 0);
        assert!(registry.match_text("bitcoin").await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_is_not_credited_to_a_replacement() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry.register_job(config("a", "bitcoin", &sink)).await;
        let matched = registry.match_text("bitcoin").await;
        assert_eq!(matched.len(), 1);

        assert_eq!(registry.record_delivery(&matched[0]).await, Some(1));

        registry.register_job(config("a", "bitcoin", &sink)).await;
        assert_eq!(registry.record_delivery(&matched[0]).await, None);
        let job = registry.get_job(&JobId::new("a")).await.unwrap();
        assert_eq!(job.matched_count, 0);

        registry.unregister_job(&JobId::new("a")).await;
        assert_eq!(registry.record_delivery(&matched[0]).await, None);
    }

    #[tokio::test]
    async fn test_complete_calls_on_complete_and_unregister_does_not() {
        let registry = JobRegistry::new();
        let completed = RecordingSink::new();
        let cancelled = RecordingSink::new();
        registry.register_job(config("done", "bitcoin", &completed)).await;
        registry.register_job(config("gone", "bitcoin", &cancelled)).await;

        registry.increment_matched_count(&JobId::new("done")).await;
        registry.increment_matched_count(&JobId::new("done")).await;

        assert_eq!(registry.complete_job(&JobId::new("done")).await, Some(2));
        assert!(registry.unregister_job(&JobId::new("gone")).await);

        assert_eq!(completed.completions(), vec![2]);
        assert!(cancelled.completions().is_empty());
        assert!(!registry.has_active_jobs().await);
    }

    #[tokio::test]
    async fn test_missing_job_operations_are_noops() {
        let registry = JobRegistry::new();
        let missing = JobId::new("missing");
        assert_eq!(registry.complete_job(&missing).await, None);
        assert!(!registry.unregister_job(&missing).await);
        assert_eq!(registry.increment_matched_count(&missing).await, None);
        assert!(registry.get_job(&missing).await.is_none());
    }

    #[tokio::test]
    async fn test_match_text_preserves_registration_order() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry.register_job(config("moon", "moon", &sink)).await;
        registry.register_job(config("btc", "bitcoin", &sink)).await;
        registry.register_job(config("eth", "ethereum", &sink)).await;
        registry.register_job(config("empty", "the and of", &sink)).await;

        let matched: Vec<String> = registry
            .match_text("Bitcoin to the moon!")
            .await
            .into_iter()
            .map(|m| m.job_id.to_string())
            .collect();
        assert_eq!(matched, ["moon", "btc"]);
        assert!(registry.match_text("the and of").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_completes_job_with_accumulated_count() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry
            .register_job(config("timed", "bitcoin", &sink).with_max_duration_ms(5000))
            .await;

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert!(registry.has_job(&JobId::new("timed")).await);
        assert!(sink.completions().is_empty());

        sink.wait_completed(Duration::from_millis(10)).await;
        assert_eq!(sink.completions(), vec![0]);
        assert!(!registry.has_active_jobs().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_times_out() {
        let registry = JobRegistry::new();
        let sink = RecordingSink::new();
        registry
            .register_job(config("forever", "bitcoin", &sink).with_max_duration_ms(0))
            .await;

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert!(registry.has_job(&JobId::new("forever")).await);
        assert!(sink.completions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_job_timer_never_fires() {
        let registry = JobRegistry::new();
        let first = RecordingSink::new();
        let second = RecordingSink::new();
        registry
            .register_job(config("a", "bitcoin", &first).with_max_duration_ms(1000))
            .await;
        registry.unregister_job(&JobId::new("a")).await;

        registry
            .register_job(config("a", "bitcoin", &second).with_max_duration_ms(3000))
            .await;

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(first.completions().is_empty());
        assert!(registry.has_job(&JobId::new("a")).await);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        tokio::task::yield_now().await;
        assert!(first.completions().is_empty());
        assert_eq!(second.completions(), vec![0]);
    }
}
