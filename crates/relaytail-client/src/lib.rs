//! Relay client that pairs posts with their authors' profiles.
//!
//! # Modules
//!
//! - [`cache`] - Correlation cache holding posts until their author's profile arrives
//! - [`queue`] - Result queue between inbound dispatch and the consumer
//! - [`session`] - WebSocket session: connect, dispatch, keepalive, shutdown
//! - [`config`] - Session configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   REQ feed-<session> (periodic)
//! │      Relay      │◄────────────────────────────────┐
//! └────────┬────────┘   REQ profile-<pubkey[..8]>     │
//!          │ frames                                   │
//!          ▼                                          │
//! ┌─────────────────┐                        ┌────────┴────────┐
//! │     Session     │───────────────────────►│ outbound writer │
//! └────────┬────────┘                        └─────────────────┘
//!          ▼
//! ┌─────────────────┐
//! │CorrelationCache │  pending: pubkey -> latest post
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │   ResultQueue   │  drained by the consumer
//! └─────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod session;

pub use error::{Error, Result};

pub use cache::{
    CacheStats, Classifier, CorrelatedResult, CorrelationCache, Discard, InboundOutcome,
};
pub use config::{DEFAULT_RELAY_URL, SessionConfig};
pub use queue::ResultQueue;
pub use session::{Session, SessionState};
