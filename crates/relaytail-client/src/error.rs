//! Error types for the relay client.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a relay session.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error (connect, send, receive).
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connecting took longer than the configured timeout.
    #[error("Connection timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Relay URL is malformed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A frame was sent while no connection is open.
    #[error("Not connected to relay")]
    NotConnected,

    /// The session was stopped and cannot be used again.
    #[error("Session closed")]
    Closed,

    /// `start` was called while a connection is already running.
    #[error("Session already running")]
    AlreadyRunning,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_not_connected_display() {
        assert_eq!(Error::NotConnected.to_string(), "Not connected to relay");
    }

    #[test]
    fn test_connect_timeout_display() {
        let msg = Error::ConnectTimeout(Duration::from_secs(10)).to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("10s"));
    }

    #[test]
    fn test_from_url_parse_error() {
        let err: Error = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, Error::UrlParse(_)));
    }
}
