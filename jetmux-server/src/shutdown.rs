//! Signal handling for graceful shutdown and standing-job reload.

use crate::config::{ConfigLoader, StandingJob};
use crate::sink::JsonLinesOutput;
use jetmux_core::processors::StreamManager;
use jetmux_core::registry::JobConfig;
use jetmux_sdk::JobId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;

/// Creates a future that completes when a shutdown signal is received.
///
/// Listens for SIGTERM and SIGINT (Ctrl+C).
pub async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

/// Register one standing job with a fresh correlation id.
pub async fn register_standing_job(
    manager: &StreamManager,
    output: &JsonLinesOutput,
    job: &StandingJob,
) {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut config = JobConfig::new(job.id.clone(), job.prompt.clone(), output.sink_for(job.id.clone()))
        .with_correlation_id(correlation_id);
    config.max_duration = job.max_duration;

    if let Err(e) = manager.register_job(config).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to register standing job");
    }
}

/// What a reload has to do to move from one set of standing jobs to the
/// next.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    pub cancel: Vec<JobId>,
    pub register: Vec<StandingJob>,
}

/// Diff two job lists.
///
/// Removed ids are cancelled, new ids registered, and changed ids
/// registered again (which replaces the running job). Unchanged jobs are
/// left alone.
pub fn plan_reload(current: &[StandingJob], next: &[StandingJob]) -> ReloadPlan {
    let current_by_id: HashMap<&JobId, &StandingJob> = current.iter().map(|j| (&j.id, j)).collect();
    let next_by_id: HashMap<&JobId, &StandingJob> = next.iter().map(|j| (&j.id, j)).collect();

    let cancel = current
        .iter()
        .filter(|j| !next_by_id.contains_key(&j.id))
        .map(|j| j.id.clone())
        .collect();
    let register = next
        .iter()
        .filter(|job| current_by_id.get(&job.id).is_none_or(|old| **old != **job))
        .cloned()
        .collect();

    ReloadPlan { cancel, register }
}

/// Spawns a task that listens for SIGHUP and reconciles standing jobs.
///
/// Unchanged jobs that have since timed out are registered again. Changes
/// to the `[jetstream]`, `[resolver]` and `[router]` sections need a
/// restart.
///
/// Returns a Notify that can be used to stop the handler.
pub fn spawn_job_reload_handler(
    manager: StreamManager,
    output: JsonLinesOutput,
    config_loader: Arc<ConfigLoader>,
    initial_jobs: Vec<StandingJob>,
) -> std::io::Result<Arc<Notify>> {
    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = shutdown_notify.clone();
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let mut current = initial_jobs;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!(path = ?config_loader.path(), "Received SIGHUP, reloading standing jobs");
                    let loaded = match config_loader.reload() {
                        Ok(loaded) => loaded,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload configuration");
                            continue;
                        }
                    };

                    let plan = plan_reload(&current, &loaded.jobs);
                    for job_id in &plan.cancel {
                        manager.cancel_job(job_id).await;
                    }
                    for job in &plan.register {
                        register_standing_job(&manager, &output, job).await;
                    }
                    for job in &loaded.jobs {
                        if !plan.register.contains(job) && !manager.is_job_registered(&job.id).await {
                            register_standing_job(&manager, &output, job).await;
                        }
                    }

                    tracing::info!(
                        cancelled = plan.cancel.len(),
                        registered = plan.register.len(),
                        standing_jobs = loaded.jobs.len(),
                        "Standing jobs reloaded"
                    );
                    current = loaded.jobs;
                }
                _ = shutdown_notify_clone.notified() => {
                    tracing::debug!("Job reload handler shutting down");
                    break;
                }
            }
        }
    });

    Ok(shutdown_notify)
}
