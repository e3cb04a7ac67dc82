//! Inbound relay frames and event payloads.
//!
//! Relays interleave plain-text control strings (end-of-stored-events markers,
//! rate-limit notices) with JSON envelopes of the form
//! `["EVENT", <subscription label>, <event>]`. [`is_control_frame`] recognises
//! the former on the raw text; [`parse_relay_event`] turns the latter into a
//! typed [`RelayEvent`].
//!
//! Only `id`, `pubkey`, `kind` and `content` are interpreted. Every other event
//! field (signature, timestamp, tags) is carried through untouched in
//! [`EventPayload::extra`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile metadata (NIP-01 kind 0).
pub const KIND_METADATA: u16 = 0;

/// Short text note.
pub const KIND_TEXT_NOTE: u16 = 1;

/// Repost.
pub const KIND_REPOST: u16 = 6;

/// Kinds treated as posts awaiting their author's profile.
pub const CONTENT_KINDS: [u16; 2] = [KIND_TEXT_NOTE, KIND_REPOST];

/// Substrings that mark a frame as relay control traffic.
pub const CONTROL_MARKERS: &[&str] = &["EOSE", "too many concurrent REQs"];

/// Event fields relevant to correlation, generic over the content shape.
///
/// Posts keep their content as the raw string; profiles carry the decoded
/// content document (`EventPayload<Value>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload<C = String> {
    /// Event ID (hex).
    pub id: String,

    /// Author public key (hex). Used as the correlation key.
    pub pubkey: String,

    /// Event kind discriminator.
    pub kind: u16,

    /// Event content.
    pub content: C,

    /// Remaining protocol fields, passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A profile event whose content has been decoded into a structured document.
pub type ProfilePayload = EventPayload<Value>;

impl EventPayload<String> {
    /// Replace the content, keeping every other field.
    pub fn with_content<D>(self, content: D) -> EventPayload<D> {
        EventPayload {
            id: self.id,
            pubkey: self.pubkey,
            kind: self.kind,
            content,
            extra: self.extra,
        }
    }

    /// Try to decode the content as a serialized document.
    pub fn decode_content(&self) -> Option<Value> {
        decode_content_document(&self.content)
    }
}

/// A tagged envelope received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    /// Subscription label echoed back by the relay.
    pub subscription_label: String,

    /// The event itself.
    pub payload: EventPayload,
}

/// Role of an event in correlation, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Author metadata (kind 0).
    Profile,
    /// Post or repost (kinds 1 and 6).
    Content,
    /// Anything else.
    Other,
}

impl EventClass {
    /// Classify a kind number.
    pub fn of_kind(kind: u16) -> Self {
        if kind == KIND_METADATA {
            Self::Profile
        } else if CONTENT_KINDS.contains(&kind) {
            Self::Content
        } else {
            Self::Other
        }
    }
}

/// Returns true for frames that must be dropped before any parsing: empty
/// frames and frames carrying a control marker anywhere in their text.
pub fn is_control_frame(raw: &str) -> bool {
    raw.trim().is_empty() || CONTROL_MARKERS.iter().any(|marker| raw.contains(marker))
}

/// Decode a content string as a serialized document.
///
/// A failure here is not an error: it is how opaque post text is told apart
/// from profile documents.
pub fn decode_content_document(content: &str) -> Option<Value> {
    serde_json::from_str(content).ok()
}

/// Parse an `["EVENT", label, event]` envelope.
///
/// # Errors
///
/// Returns an error if the frame is not JSON, is not an `EVENT` envelope, or
/// the event lacks a usable `id`, `pubkey`, `kind` or `content`.
pub fn parse_relay_event(raw: &str) -> Result<RelayEvent> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(items) = value else {
        return Err(Error::InvalidEnvelope("frame is not an array".to_string()));
    };
    if items.len() < 3 {
        return Err(Error::InvalidEnvelope(format!(
            "expected at least 3 elements, got {}",
            items.len()
        )));
    }

    let mut items = items.into_iter();
    let (Some(message_type), Some(label), Some(payload)) =
        (items.next(), items.next(), items.next())
    else {
        return Err(Error::InvalidEnvelope("truncated envelope".to_string()));
    };

    match message_type.as_str() {
        Some("EVENT") => {}
        Some(other) => {
            return Err(Error::InvalidEnvelope(format!(
                "expected EVENT, got {other}"
            )));
        }
        None => {
            return Err(Error::InvalidEnvelope(
                "message type is not a string".to_string(),
            ));
        }
    }

    let Value::String(subscription_label) = label else {
        return Err(Error::InvalidField {
            field: "subscription_label",
            reason: "not a string".to_string(),
        });
    };

    let payload: EventPayload = serde_json::from_value(payload)?;
    if payload.pubkey.is_empty() {
        return Err(Error::InvalidField {
            field: "pubkey",
            reason: "must not be empty".to_string(),
        });
    }

    Ok(RelayEvent {
        subscription_label,
        payload,
    })
}
