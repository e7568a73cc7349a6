//! Cached DID-to-handle resolution against the public Bluesky AppView.

use super::HandleResolver;
use async_trait::async_trait;
use jetmux_sdk::ResolverMetrics;
use moka::future::Cache;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Public AppView host serving unauthenticated profile lookups.
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";

const GET_PROFILE_PATH: &str = "/xrpc/app.bsky.actor.getProfile";

/// Placeholder handle the AppView reports for accounts whose handle no
/// longer verifies.
const INVALID_HANDLE: &str = "handle.invalid";

/// Errors that can occur while resolving a handle.
///
/// These never escape [`HandleResolver::resolve_handle`]; they only decide
/// that the DID is used instead.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Endpoint URL could not be built
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// AppView answered with a non-2xx status
    #[error("lookup failed with status {0}")]
    Status(u16),

    /// The account has no verified handle
    #[error("account has no valid handle")]
    InvalidHandle,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub endpoint: Url,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    pub request_timeout: Duration,
}

impl ResolverConfig {
    /// Default settings against the public Bluesky AppView.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_endpoint(DEFAULT_APPVIEW_URL)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self, ResolveError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
            request_timeout: Duration::from_secs(5),
        })
    }
}

/// [`HandleResolver`] that queries `app.bsky.actor.getProfile` and caches
/// successful lookups. Failed lookups are not cached.
pub struct BskyHandleResolver {
    http: reqwest::Client,
    profile_url: Url,
    cache: Cache<String, String>,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct ProfileView {
    handle: String,
}

impl BskyHandleResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolveError> {
        let profile_url = config.endpoint.join(GET_PROFILE_PATH)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();

        Ok(Self {
            http,
            profile_url,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    #[tracing::instrument(skip(self), err(level = "debug"), name = "HTTP:GetProfile")]
    async fn fetch_handle(&self, did: &str) -> Result<String, ResolveError> {
        let response = self
            .http
            .get(self.profile_url.clone())
            .query(&[("actor", did)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Status(status.as_u16()));
        }

        let profile: ProfileView = response.json().await?;
        if profile.handle == INVALID_HANDLE {
            return Err(ResolveError::InvalidHandle);
        }
        Ok(profile.handle)
    }
}

#[async_trait]
impl HandleResolver for BskyHandleResolver {
    async fn resolve_handle(&self, did: &str) -> String {
        if let Some(handle) = self.cache.get(did).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return handle;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.fetch_handle(did).await {
            Ok(handle) => {
                self.cache.insert(did.to_string(), handle.clone()).await;
                handle
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(%did, error = %e, "Handle resolution failed, falling back to DID");
                did.to_string()
            }
        }
    }

    fn metrics(&self) -> ResolverMetrics {
        let cache_hits = self.hits.load(Ordering::Relaxed);
        let cache_misses = self.misses.load(Ordering::Relaxed);
        ResolverMetrics {
            cache_hits,
            cache_misses,
            failures: self.failures.load(Ordering::Relaxed),
            cache_size: self.cache.entry_count(),
            hit_rate: ResolverMetrics::compute_hit_rate(cache_hits, cache_misses),
        }
    }
}
