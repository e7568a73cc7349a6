//! Keyword filter.
//!
//! Receives `Post` events from the stream manager, matches them against the
//! registry and fans each matched post out to the sinks of the matching
//! jobs. Every sink runs in its own task, so one failing or panicking sink
//! never prevents delivery to the others.

use crate::registry::{JobRegistry, JobSummary, MatchedJob};
use crate::upstream::HandleResolver;
use jetmux_sdk::{MessageTemplate, Post, ResolverMetrics};
use kanau::processor::Processor;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

/// Matching statistics, including a summary of every active job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStats {
    pub active_jobs: usize,
    pub jobs: Vec<JobSummary>,
    pub posts_evaluated: u64,
    pub posts_matched: u64,
    pub dispatches_succeeded: u64,
    pub dispatches_failed: u64,
}

#[derive(Default)]
struct FilterCounters {
    posts_evaluated: AtomicU64,
    posts_matched: AtomicU64,
    dispatches_succeeded: AtomicU64,
    dispatches_failed: AtomicU64,
}

pub struct KeywordFilter {
    registry: JobRegistry,
    resolver: Arc<dyn HandleResolver>,
    counters: FilterCounters,
}

impl KeywordFilter {
    pub fn new(registry: JobRegistry, resolver: Arc<dyn HandleResolver>) -> Self {
        Self {
            registry,
            resolver,
            counters: FilterCounters::default(),
        }
    }

    /// The jobs matching `post`, in registration order.
    ///
    /// The result reflects the registry at the time of the call. Jobs
    /// registered afterwards never see this post.
    pub async fn match_post(&self, post: &Post) -> Vec<MatchedJob> {
        self.counters.posts_evaluated.fetch_add(1, Ordering::Relaxed);
        self.registry.match_text(&post.text).await
    }

    /// Deliver `post` to every job in `matched` and return how many jobs it
    /// was dispatched to.
    ///
    /// The author handle is resolved once per post and only when at least
    /// one job matched. A job's matched count is incremented only after its
    /// sink accepted the message, and only if the job has not been removed
    /// or replaced in the meantime.
    #[tracing::instrument(skip_all, fields(did = %post.did, rkey = %post.rkey, jobs = matched.len()))]
    pub async fn dispatch(&self, post: Post, matched: Vec<MatchedJob>) -> usize {
        if matched.is_empty() {
            return 0;
        }
        self.counters.posts_matched.fetch_add(1, Ordering::Relaxed);

        let author = match &post.handle {
            Some(handle) => handle.clone(),
            None => self.resolver.resolve_handle(&post.did).await,
        };
        let template = MessageTemplate::from_post(&post, &author, OffsetDateTime::now_utc());

        let deliveries: Vec<_> = matched
            .iter()
            .map(|job| {
                let message = template.for_job(job.job_id.clone(), job.correlation_id.clone());
                let sink = Arc::clone(&job.sink);
                (job, tokio::spawn(async move { sink.on_data(message).await }))
            })
            .collect();

        for (job, delivery) in deliveries {
            match delivery.await {
                Ok(Ok(())) => {
                    self.counters.dispatches_succeeded.fetch_add(1, Ordering::Relaxed);
                    match self.registry.record_delivery(job).await {
                        Some(count) => {
                            debug!(job_id = %job.job_id, matched_count = count, "Dispatched post to job");
                        }
                        None => {
                            debug!(job_id = %job.job_id, "Job left or was replaced during delivery, not counted");
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.counters.dispatches_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %job.job_id,
                        correlation_id = %job.correlation_id,
                        error = %e,
                        "Sink rejected matched post"
                    );
                }
                Err(e) => {
                    self.counters.dispatches_failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        job_id = %job.job_id,
                        correlation_id = %job.correlation_id,
                        error = %e,
                        "Sink task failed while handling matched post"
                    );
                }
            }
        }

        matched.len()
    }

    /// Match and dispatch one post. Returns the number of jobs it matched.
    pub async fn process_post(&self, post: Post) -> usize {
        match self.process(post).await {
            Ok(matched) => matched,
            Err(never) => match never {},
        }
    }

    pub async fn match_stats(&self) -> MatchStats {
        let jobs: Vec<JobSummary> = self
            .registry
            .get_active_jobs()
            .await
            .iter()
            .map(JobSummary::from)
            .collect();
        MatchStats {
            active_jobs: jobs.len(),
            jobs,
            posts_evaluated: self.counters.posts_evaluated.load(Ordering::Relaxed),
            posts_matched: self.counters.posts_matched.load(Ordering::Relaxed),
            dispatches_succeeded: self.counters.dispatches_succeeded.load(Ordering::Relaxed),
            dispatches_failed: self.counters.dispatches_failed.load(Ordering::Relaxed),
        }
    }

    pub fn resolver_metrics(&self) -> ResolverMetrics {
        self.resolver.metrics()
    }

    pub fn reset_stats(&self) {
        self.counters.posts_evaluated.store(0, Ordering::Relaxed);
        self.counters.posts_matched.store(0, Ordering::Relaxed);
        self.counters.dispatches_succeeded.store(0, Ordering::Relaxed);
        self.counters.dispatches_failed.store(0, Ordering::Relaxed);
    }
}

impl Processor<Post> for KeywordFilter {
    type Output = usize;
    type Error = Infallible;

    async fn process(&self, post: Post) -> Result<usize, Infallible> {
        let matched = self.match_post(&post).await;
        Ok(self.dispatch(post, matched).await)
    }
}
