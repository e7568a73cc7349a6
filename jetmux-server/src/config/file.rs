//! TOML file configuration structures.
//!
//! These structs directly map to the `jetmux.toml` file format. Every
//! section is optional; a file containing only `[[jobs]]` entries is valid.

use jetmux_sdk::objects::jetstream::POST_COLLECTION;
use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub jetstream: JetstreamSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub jobs: Vec<JobSection>,
}

/// Upstream firehose connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetstreamSection {
    /// Public Bluesky instance when unset.
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default = "default_wanted_collections")]
    pub wanted_collections: Vec<String>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for JetstreamSection {
    fn default() -> Self {
        Self {
            url: None,
            wanted_collections: default_wanted_collections(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

fn default_wanted_collections() -> Vec<String> {
    vec![POST_COLLECTION.to_string()]
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

/// Handle resolution against the AppView.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSection {
    /// Public Bluesky AppView when unset.
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_capacity() -> u64 {
    10_000
}

/// Stream manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_max_in_flight_posts")]
    pub max_in_flight_posts: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval_secs(),
            max_in_flight_posts: default_max_in_flight_posts(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_max_in_flight_posts() -> usize {
    256
}

/// A standing job, registered at startup and on every reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSection {
    pub id: String,
    pub prompt: String,
    /// `0` means the job never times out.
    #[serde(default)]
    pub max_duration_secs: u64,
}
