//! Messages dispatched to job sinks.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::JobId;
use super::post::Post;
use crate::aturi::source_url;

/// Platform a matched post came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Bluesky,
}

/// One matched post, addressed to one job.
///
/// `upvotes` and `comment_count` are part of the downstream schema shared
/// with other sources; the firehose carries neither, so they are always
/// absent from the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedMessage {
    pub job_id: JobId,
    pub correlation_id: String,
    pub text_content: String,
    pub source: Source,
    pub source_url: String,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upvotes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

/// The job-independent part of a [`MatchedMessage`].
///
/// Built once per post and stamped with each matched job's identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub text_content: String,
    pub source_url: String,
    pub author_name: String,
    pub published_at: OffsetDateTime,
    pub collected_at: OffsetDateTime,
}

impl MessageTemplate {
    /// `author` is the resolved handle, or the DID when no handle is known.
    pub fn from_post(post: &Post, author: &str, collected_at: OffsetDateTime) -> Self {
        Self {
            text_content: post.text.clone(),
            source_url: source_url(post, author),
            author_name: author.to_string(),
            published_at: post.created_at,
            collected_at,
        }
    }

    pub fn for_job(&self, job_id: JobId, correlation_id: impl Into<String>) -> MatchedMessage {
        MatchedMessage {
            job_id,
            correlation_id: correlation_id.into(),
            text_content: self.text_content.clone(),
            source: Source::Bluesky,
            source_url: self.source_url.clone(),
            author_name: self.author_name.clone(),
            upvotes: None,
            comment_count: None,
            published_at: self.published_at,
            collected_at: self.collected_at,
        }
    }
}
