use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A Bluesky post as delivered by the transport.
///
/// `handle` is only present when the upstream already knows the author's
/// handle; otherwise the router resolves it from `did` on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Author DID, e.g. `did:plc:abc123`.
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub text: String,
    /// AT-URI of the record, `at://{did}/app.bsky.feed.post/{rkey}`.
    pub uri: String,
    pub rkey: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
