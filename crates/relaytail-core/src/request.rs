//! Outbound subscription requests.
//!
//! Requests are serialized as `["REQ", <label>, <filter>]`. Two shapes are
//! used: the feed request that keeps the primary subscription alive, and the
//! per-author profile request issued when a post arrives before its author's
//! metadata.

use crate::event::{CONTENT_KINDS, KIND_METADATA};
use serde::Serialize;
use serde_json::Value;

/// Prefix of the feed subscription label.
pub const FEED_LABEL_PREFIX: &str = "feed-";

/// Prefix of profile subscription labels.
pub const PROFILE_LABEL_PREFIX: &str = "profile-";

/// Number of pubkey characters used in a profile label.
pub const PROFILE_LABEL_PUBKEY_CHARS: usize = 8;

/// Subscription filter. Unset fields are omitted from the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A `REQ` frame ready to be sent to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Subscription label. Re-sending a frame with the same label replaces
    /// the existing subscription instead of opening a new one.
    pub label: String,

    /// Filter for the subscription.
    pub filter: Filter,
}

impl RequestFrame {
    pub fn new(label: impl Into<String>, filter: Filter) -> Self {
        Self {
            label: label.into(),
            filter,
        }
    }

    /// The frame as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::json!(["REQ", self.label, self.filter])
    }

    /// Serialize to the text frame sent over the wire.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Request the most recent post or repost, labeled `feed-<session_id>`.
pub fn build_feed_request(session_id: &str) -> RequestFrame {
    RequestFrame::new(
        format!("{FEED_LABEL_PREFIX}{session_id}"),
        Filter::new().kinds(CONTENT_KINDS).limit(1),
    )
}

/// Request the metadata event of a single author, labeled
/// `profile-<first 8 characters of pubkey>`.
///
/// Distinct pubkeys may share a label; the relay tells them apart by the
/// `authors` filter.
pub fn build_profile_request(pubkey: &str) -> RequestFrame {
    RequestFrame::new(
        format!("{PROFILE_LABEL_PREFIX}{}", pubkey_prefix(pubkey)),
        Filter::new()
            .kinds([KIND_METADATA])
            .authors([pubkey.to_string()]),
    )
}

/// First [`PROFILE_LABEL_PUBKEY_CHARS`] characters of a pubkey, or the whole
/// key if it is shorter.
fn pubkey_prefix(pubkey: &str) -> &str {
    match pubkey.char_indices().nth(PROFILE_LABEL_PUBKEY_CHARS) {
        Some((end, _)) => &pubkey[..end],
        None => pubkey,
    }
}
