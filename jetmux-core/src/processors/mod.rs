//! Processors of the routing pipeline.
//!
//! - `StreamManager`: owns the firehose connection, receives `Post` events
//!   and hands matched posts to the filter
//! - `KeywordFilter`: matches posts against the registry and dispatches
//!   them to job sinks

pub mod keyword_filter;
pub mod stream_manager;

pub use keyword_filter::{KeywordFilter, MatchStats};
pub use stream_manager::{
    ManagerStatus, StreamError, StreamManager, StreamManagerConfig, StreamStats,
};
