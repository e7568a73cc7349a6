//! Configuration module for jetmux-server.
//!
//! Handles loading configuration from the TOML file and CLI overrides, and
//! turns it into the settings of the core components.

pub mod file;

use crate::config::file::{FileConfig, JobSection};
use jetmux_core::processors::StreamManagerConfig;
use jetmux_core::TransportError;
use jetmux_core::upstream::handle_resolver::ResolveError;
use jetmux_core::upstream::{JetstreamConfig, ResolverConfig};
use jetmux_sdk::JobId;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid jetstream endpoint: {0}")]
    JetstreamEndpoint(#[from] TransportError),

    #[error("invalid resolver endpoint: {0}")]
    ResolverEndpoint(#[from] ResolveError),
}

/// A job that is kept registered for as long as it stays in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandingJob {
    pub id: JobId,
    pub prompt: String,
    pub max_duration: Option<Duration>,
}

impl From<JobSection> for StandingJob {
    fn from(job: JobSection) -> Self {
        Self {
            id: JobId::from(job.id),
            prompt: job.prompt,
            max_duration: (job.max_duration_secs > 0)
                .then(|| Duration::from_secs(job.max_duration_secs)),
        }
    }
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub jetstream: JetstreamConfig,
    pub resolver: ResolverConfig,
    pub router: StreamManagerConfig,
    pub jobs: Vec<StandingJob>,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    jetstream_url_override: Option<Url>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, jetstream_url_override: Option<Url>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            jetstream_url_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(url) = &self.jetstream_url_override {
            file_config.jetstream.url = Some(url.clone());
        }

        validate(&file_config)?;
        build_loaded_config(file_config)
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.router.max_in_flight_posts == 0 {
        return Err(ConfigError::ValidationError(
            "router.max_in_flight_posts must be at least 1".to_string(),
        ));
    }
    if config.router.metrics_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "router.metrics_interval_secs must be at least 1".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for job in &config.jobs {
        if job.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "job id must not be empty".to_string(),
            ));
        }
        if job.prompt.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "job {} has an empty prompt",
                job.id
            )));
        }
        if !seen.insert(job.id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "job {} is defined more than once",
                job.id
            )));
        }
    }
    Ok(())
}

fn build_loaded_config(file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
    let mut jetstream = JetstreamConfig::new()?;
    if let Some(url) = file_config.jetstream.url {
        jetstream.url = url;
    }
    jetstream.wanted_collections = file_config.jetstream.wanted_collections;
    jetstream.max_reconnect_attempts = file_config.jetstream.max_reconnect_attempts;

    let mut resolver = ResolverConfig::new()?;
    if let Some(endpoint) = file_config.resolver.endpoint {
        resolver.endpoint = endpoint;
    }
    resolver.cache_ttl = Duration::from_secs(file_config.resolver.cache_ttl_secs);
    resolver.cache_capacity = file_config.resolver.cache_capacity;

    let router = StreamManagerConfig {
        metrics_interval: Duration::from_secs(file_config.router.metrics_interval_secs),
        max_in_flight_posts: file_config.router.max_in_flight_posts,
    };

    Ok(LoadedConfig {
        jetstream,
        resolver,
        router,
        jobs: file_config.jobs.into_iter().map(StandingJob::from).collect(),
    })
}
