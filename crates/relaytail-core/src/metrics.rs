//! Prometheus metrics helpers.
//!
//! Metrics are recorded through the `metrics` facade. Without an installed
//! recorder every macro call is a no-op, so library code records
//! unconditionally and only the binary decides whether to export.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relaytail_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//! }
//! ```
//!
//! # Naming
//!
//! All metrics are prefixed `feed_`, with `_total` for counters. The only
//! label is `reason` on `feed_frames_discarded_total`.

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_feed_metrics();

    handle
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning so bind errors reach the caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the client's metrics.
fn register_feed_metrics() {
    // =========================================================================
    // Inbound frames
    // =========================================================================

    describe_counter!("feed_frames_total", "Text frames received from the relay");
    describe_counter!(
        "feed_frames_discarded_total",
        "Frames dropped before correlation (label: reason)"
    );

    // =========================================================================
    // Correlation
    // =========================================================================

    describe_counter!(
        "feed_results_emitted_total",
        "Posts paired with their author's profile"
    );
    describe_counter!(
        "feed_profile_requests_total",
        "Profile requests issued for posts with no known author"
    );
    describe_counter!(
        "feed_pending_superseded_total",
        "Pending posts overwritten by a newer post from the same author"
    );
    describe_counter!(
        "feed_profiles_unmatched_total",
        "Profile events dropped because no post was waiting for them"
    );
    describe_gauge!(
        "feed_pending_entries",
        "Posts currently waiting for their author's profile"
    );

    // =========================================================================
    // Connection
    // =========================================================================

    describe_gauge!(
        "feed_connected",
        "Whether the relay connection is open (1=yes, 0=no)"
    );
    describe_counter!(
        "feed_transport_errors_total",
        "Connection failures and WebSocket errors"
    );
}
