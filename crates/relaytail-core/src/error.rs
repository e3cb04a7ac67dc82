//! Error types for relay protocol handling.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or building relay frames.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame is valid JSON but not a recognised envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Event payload has a missing or badly typed field.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
