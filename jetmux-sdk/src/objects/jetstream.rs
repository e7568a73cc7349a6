//! Jetstream wire frames.
//!
//! Jetstream sends one JSON object per WebSocket text frame:
//!
//! ```json
//! {"did":"did:plc:abc","time_us":1725911162329308,"kind":"commit",
//!  "commit":{"rev":"...","operation":"create","collection":"app.bsky.feed.post",
//!            "rkey":"3l3qo2vutsw2b","record":{"text":"gm","createdAt":"2024-09-09T19:46:02.102Z"},
//!            "cid":"..."}}
//! ```
//!
//! Only `commit` frames that create an `app.bsky.feed.post` record become a
//! [`Post`]; everything else is reported as a [`FrameError`] so that the
//! caller can count and skip it.

use serde::Deserialize;
use time::OffsetDateTime;

use super::post::Post;
use crate::aturi::post_at_uri;

/// Collection NSID of Bluesky posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Reasons a frame does not yield a post.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a commit event")]
    NotACommit,
    #[error("commit operation is not a create")]
    NotACreate,
    #[error("collection {0} is not a post collection")]
    WrongCollection(String),
    #[error("commit carries no record")]
    MissingRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

/// A decoded Jetstream frame.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    /// Server timestamp in microseconds; doubles as the resume cursor.
    pub time_us: i64,
    pub kind: EventKind,
    #[serde(default)]
    pub commit: Option<CommitEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitEvent {
    pub operation: CommitOperation,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
}

impl JetstreamEvent {
    /// Decode a single text frame.
    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Convert a post-creating commit into a [`Post`].
    ///
    /// The record's `createdAt` is author-supplied and occasionally
    /// malformed, in which case the server timestamp is used instead.
    pub fn into_post(self) -> Result<Post, FrameError> {
        if self.kind != EventKind::Commit {
            return Err(FrameError::NotACommit);
        }
        let commit = self.commit.ok_or(FrameError::NotACommit)?;
        if commit.operation != CommitOperation::Create {
            return Err(FrameError::NotACreate);
        }
        if commit.collection != POST_COLLECTION {
            return Err(FrameError::WrongCollection(commit.collection));
        }
        let record = commit.record.ok_or(FrameError::MissingRecord)?;
        let record: PostRecord = serde_json::from_value(record)?;

        let created_at = record
            .created_at
            .as_deref()
            .and_then(|s| {
                OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok()
            })
            .or_else(|| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.time_us) * 1_000).ok()
            })
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(Post {
            uri: post_at_uri(&self.did, &commit.rkey),
            did: self.did,
            handle: None,
            text: record.text,
            rkey: commit.rkey,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE_FRAME: &str = r#"{
        "did": "did:plc:eygmaihciaxprqvxpfvl6flk",
        "time_us": 1725911162329308,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vuowo2b",
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "3l3qo2vutsw2b",
            "record": {
                "$type": "app.bsky.feed.post",
                "createdAt": "2024-09-09T19:46:02.102Z",
                "langs": ["en"],
                "text": "I just bought bitcoin!"
            },
            "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
        }
    }"#;

    #[test]
    fn test_decode_post_create() {
        let post = JetstreamEvent::decode(CREATE_FRAME)
            .unwrap()
            .into_post()
            .unwrap();
        assert_eq!(post.did, "did:plc:eygmaihciaxprqvxpfvl6flk");
        assert_eq!(post.rkey, "3l3qo2vutsw2b");
        assert_eq!(
            post.uri,
            "at://did:plc:eygmaihciaxprqvxpfvl6flk/app.bsky.feed.post/3l3qo2vutsw2b"
        );
        assert_eq!(post.text, "I just bought bitcoin!");
        assert_eq!(post.handle, None);
        assert_eq!(post.created_at.year(), 2024);
    }

    #[test]
    fn test_malformed_created_at_falls_back_to_server_time() {
        let frame = CREATE_FRAME.replace("2024-09-09T19:46:02.102Z", "yesterday");
        let post = JetstreamEvent::decode(&frame).unwrap().into_post().unwrap();
        assert_eq!(post.created_at.unix_timestamp(), 1725911162);
    }

    #[test]
    fn test_non_post_frames_are_rejected() {
        let like = CREATE_FRAME.replace("app.bsky.feed.post\"", "app.bsky.feed.like\"");
        assert!(matches!(
            JetstreamEvent::decode(&like).unwrap().into_post(),
            Err(FrameError::WrongCollection(c)) if c == "app.bsky.feed.like"
        ));

        let delete = CREATE_FRAME.replace("\"create\"", "\"delete\"");
        assert!(matches!(
            JetstreamEvent::decode(&delete).unwrap().into_post(),
            Err(FrameError::NotACreate)
        ));

        let identity = r#"{"did":"did:plc:abc","time_us":1,"kind":"identity",
            "identity":{"did":"did:plc:abc","handle":"alice.bsky.social","seq":1,"time":"2024-09-09T19:46:02.102Z"}}"#;
        assert!(matches!(
            JetstreamEvent::decode(identity).unwrap().into_post(),
            Err(FrameError::NotACommit)
        ));

        assert!(matches!(
            JetstreamEvent::decode("not json"),
            Err(FrameError::Json(_))
        ));
    }
}
