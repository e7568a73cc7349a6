#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod processors;
pub mod registry;
pub mod upstream;
pub mod utils;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod test_support;

pub use processors::{KeywordFilter, StreamError, StreamManager, StreamManagerConfig};
pub use registry::{JobConfig, JobRegistry, JobSink, SinkError};
pub use upstream::{HandleResolver, PostTransport, TransportError};
