//! AT-URI helpers.
//!
//! A post record is addressed as `at://{did}/{collection}/{rkey}`; its
//! public web page lives at `https://bsky.app/profile/{actor}/post/{rkey}`,
//! where `actor` may be either the handle or the DID.

use crate::objects::Post;
use crate::objects::jetstream::POST_COLLECTION;

/// Base URL of the public Bluesky web app.
pub const BSKY_APP_URL: &str = "https://bsky.app";

/// Build the AT-URI of a post record.
pub fn post_at_uri(did: &str, rkey: &str) -> String {
    format!("at://{did}/{POST_COLLECTION}/{rkey}")
}

/// Extract the record key (last path segment) from an AT-URI.
///
/// Returns `None` unless the URI has the full
/// `at://{authority}/{collection}/{rkey}` shape with a non-empty key.
pub fn rkey_from_at_uri(uri: &str) -> Option<&str> {
    let path = uri.strip_prefix("at://")?;
    let mut segments = path.split('/');
    let authority = segments.next()?;
    let collection = segments.next()?;
    let rkey = segments.next()?;
    if authority.is_empty() || collection.is_empty() || rkey.is_empty() {
        return None;
    }
    if segments.next().is_some() {
        return None;
    }
    Some(rkey)
}

/// Web URL of a post for the given actor (handle or DID).
pub fn post_web_url(actor: &str, rkey: &str) -> String {
    format!("{BSKY_APP_URL}/profile/{actor}/post/{rkey}")
}

/// Web URL of `post`, taking the key from its AT-URI and falling back to
/// the post's own `rkey` field.
pub fn source_url(post: &Post, actor: &str) -> String {
    let rkey = rkey_from_at_uri(&post.uri).unwrap_or(&post.rkey);
    post_web_url(actor, rkey)
}
