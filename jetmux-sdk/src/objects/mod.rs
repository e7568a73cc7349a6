pub mod jetstream;
pub mod message;
pub mod post;
pub mod status;

pub use message::{MatchedMessage, MessageTemplate, Source};
pub use post::Post;
pub use status::{ConnectionStatus, ResolverMetrics, TransportMetrics};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Opaque, caller-supplied identifier of a search job.
///
/// Serialized as a plain string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(CompactString);

impl JobId {
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
