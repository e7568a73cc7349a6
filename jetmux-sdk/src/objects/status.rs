use serde::{Deserialize, Serialize};

/// Connection state reported by the post transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
    Reconnecting,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Counters exposed by the post transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetrics {
    /// Every frame read from the socket, decodable or not.
    pub messages_received: u64,
    pub messages_per_second: f64,
    /// Frames that were decoded into posts and published.
    pub posts_processed: u64,
    pub connection_status: ConnectionStatus,
    pub reconnect_attempts: u32,
}

/// Cache counters exposed by the handle resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Lookups that fell back to the raw DID.
    pub failures: u64,
    pub cache_size: u64,
    /// Hit rate in `0.0..=1.0`; `0.0` before the first lookup.
    pub hit_rate: f64,
}

impl ResolverMetrics {
    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
