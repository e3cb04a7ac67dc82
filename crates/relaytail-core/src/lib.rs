//! Relay protocol types and request builders for relaytail.
//!
//! This crate provides:
//! - Inbound frame handling: control-frame filter, `EVENT` envelope parsing,
//!   kind classification and content-document decoding
//! - Outbound `REQ` frames for the feed and per-author profile subscriptions
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Everything here is pure; connection handling lives in `relaytail-client`.

mod error;
pub mod event;
pub mod metrics;
pub mod request;

pub use error::{Error, Result};
pub use event::{
    CONTENT_KINDS, CONTROL_MARKERS, EventClass, EventPayload, KIND_METADATA, KIND_REPOST,
    KIND_TEXT_NOTE, ProfilePayload, RelayEvent, decode_content_document, is_control_frame,
    parse_relay_event,
};
pub use request::{Filter, RequestFrame, build_feed_request, build_profile_request};
