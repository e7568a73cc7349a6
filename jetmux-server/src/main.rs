//! jetmux server
//!
//! Routes posts from the Bluesky Jetstream firehose to standing keyword
//! jobs and writes every match to stdout as one JSON object per line.

mod config;
mod shutdown;
mod sink;

use clap::Parser;
use config::ConfigLoader;
use jetmux_core::processors::StreamManager;
use jetmux_core::registry::JobRegistry;
use jetmux_core::upstream::{BskyHandleResolver, JetstreamClient};
use shutdown::{register_standing_job, shutdown_signal, spawn_job_reload_handler};
use sink::JsonLinesOutput;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// jetmux - Jetstream keyword job router
#[derive(Parser, Debug)]
#[command(name = "jetmux-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./jetmux.toml")]
    config: PathBuf,

    /// Override the Jetstream subscribe endpoint
    #[arg(long, env = "JETMUX_JETSTREAM_URL")]
    jetstream_url: Option<Url>,

    /// Emit logs as JSON
    #[arg(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting jetmux-server v{}", env!("CARGO_PKG_VERSION"));

    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.jetstream_url));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!(
        standing_jobs = loaded_config.jobs.len(),
        "Configuration loaded from {:?}",
        args.config
    );

    let transport = Arc::new(JetstreamClient::new(loaded_config.jetstream.clone()));
    let resolver = Arc::new(BskyHandleResolver::new(loaded_config.resolver.clone())?);
    let manager = StreamManager::new(
        JobRegistry::new(),
        transport,
        resolver,
        loaded_config.router.clone(),
    );
    let output = JsonLinesOutput::stdout();

    for job in &loaded_config.jobs {
        register_standing_job(&manager, &output, job).await;
    }

    let reload_notify = spawn_job_reload_handler(
        manager.clone(),
        output,
        config_loader,
        loaded_config.jobs,
    )?;

    shutdown_signal().await?;

    reload_notify.notify_one();
    manager.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Logs go to stderr; stdout carries matched messages only.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,jetmux_core=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
