//! Session configuration.

use crate::cache::Classifier;
use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

/// Relay used when none is configured.
pub const DEFAULT_RELAY_URL: &str = "wss://nostr.wine/";

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the relay (`ws://` or `wss://`).
    pub relay_url: String,

    /// Identifier used in the feed subscription label.
    ///
    /// Passed in explicitly so several sessions in one process get distinct
    /// feed subscriptions, and tests get predictable labels.
    pub session_id: String,

    /// How often the keepalive request is re-sent.
    ///
    /// Some relays expire idle subscriptions; re-sending the feed request
    /// under the same label refreshes it.
    pub keepalive_interval: Duration,

    /// Maximum time to wait for the WebSocket handshake.
    pub connect_timeout: Duration,

    /// How inbound events are split into posts and profiles.
    pub classifier: Classifier,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            classifier: Classifier::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration pointed at the given relay.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    /// Check the configuration and return the parsed relay URL.
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.relay_url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        if self.session_id.is_empty() {
            return Err(Error::Config("session_id must not be empty".to_string()));
        }

        if self.keepalive_interval.is_zero() {
            return Err(Error::Config(
                "keepalive_interval must be greater than zero".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(Error::Config(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(url)
    }
}
