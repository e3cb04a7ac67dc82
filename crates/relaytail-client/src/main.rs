//! relaytail - follow a relay's feed and print each post with its author's profile.
//!
//! # Usage
//!
//! ```bash
//! # Default relay, random session id
//! relaytail
//!
//! # Custom relay, faster keepalive, Prometheus metrics on :9090
//! relaytail --relay-url wss://relay.example.com --keepalive-secs 10 --metrics-port 9090
//! ```
//!
//! Each paired result is written to stdout as one JSON line; logs go to stderr.
//!
//! # Graceful Shutdown
//!
//! Ctrl+C stops the keepalive, closes the connection and prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use relaytail_client::{Classifier, DEFAULT_RELAY_URL, Session, SessionConfig, SessionState};
use relaytail_core::metrics::{init_metrics, start_metrics_server};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Stream relay posts paired with their authors' profiles.
#[derive(Parser, Debug)]
#[command(name = "relaytail")]
#[command(about = "Stream relay posts paired with their authors' profiles")]
#[command(version)]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, env = "RELAYTAIL_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    relay_url: String,

    /// Session id used in the feed subscription label (random if unset)
    #[arg(long, env = "RELAYTAIL_SESSION_ID")]
    session_id: Option<String>,

    /// Seconds between feed subscription refreshes
    #[arg(long, env = "RELAYTAIL_KEEPALIVE_SECS", default_value = "30")]
    keepalive_secs: u64,

    /// Milliseconds between result polls
    #[arg(long, env = "RELAYTAIL_POLL_MS", default_value = "1000")]
    poll_ms: u64,

    /// Seconds to wait before reconnecting after a dropped connection (0 to exit instead)
    #[arg(long, env = "RELAYTAIL_RECONNECT_SECS", default_value = "5")]
    reconnect_secs: u64,

    /// WebSocket handshake timeout in seconds
    #[arg(long, env = "RELAYTAIL_CONNECT_TIMEOUT_SECS", default_value = "10")]
    connect_timeout_secs: u64,

    /// How posts are told apart from profiles: kind | content-shape
    #[arg(long, env = "RELAYTAIL_CLASSIFIER", default_value = "kind")]
    classifier: Classifier,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "RELAYTAIL_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Either provider may already be installed by a dependency.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relaytail_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!("relaytail starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let mut config = SessionConfig::new(&args.relay_url);
    if let Some(session_id) = args.session_id {
        config.session_id = session_id;
    }
    config.keepalive_interval = Duration::from_secs(args.keepalive_secs);
    config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    config.classifier = args.classifier;

    tracing::info!("Configuration:");
    tracing::info!("  Relay: {}", config.relay_url);
    tracing::info!("  Session: {}", config.session_id);
    tracing::info!("  Keepalive: {:?}", config.keepalive_interval);
    tracing::info!("  Classifier: {}", config.classifier);

    let keepalive_interval = config.keepalive_interval;
    let session = Arc::new(Session::new(config).context("Invalid session configuration")?);

    let shutdown = CancellationToken::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        handler_shutdown.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let reconnect_delay = (args.reconnect_secs > 0).then(|| Duration::from_secs(args.reconnect_secs));
    let supervisor = tokio::spawn(reconnect_on_drop(
        Arc::clone(&session),
        reconnect_delay,
        shutdown.clone(),
    ));

    session.start().context("Failed to start session")?;

    let connected = tokio::select! {
        _ = shutdown.cancelled() => false,
        result = session.wait_until_connected() => {
            result.context("Session closed before connecting")?;
            true
        }
    };

    let mut printed = 0usize;
    if connected {
        session
            .send_periodic(session.feed_request(), keepalive_interval)
            .context("Failed to start keepalive")?;
        printed = poll_results(&session, Duration::from_millis(args.poll_ms.max(1)), &shutdown)
            .await?;
    }

    tracing::info!("Shutting down...");
    shutdown.cancel();
    session.stop().await;
    if let Err(e) = supervisor.await {
        tracing::warn!("Reconnect task panicked: {:?}", e);
    }

    // Results paired while shutting down.
    printed += print_results(&session)?;

    let stats = session.cache().stats();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Frames received:      {}", stats.frames);
    tracing::info!("Frames discarded:     {}", stats.discarded);
    tracing::info!("Profile requests:     {}", stats.profile_requests);
    tracing::info!("Posts superseded:     {}", stats.superseded);
    tracing::info!("Results printed:      {}", printed);
    tracing::info!("Still pending:        {}", session.cache().pending_len());

    Ok(())
}

/// Drain and print results every `interval` until shutdown.
async fn poll_results(
    session: &Session,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Result<usize> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(printed),
            _ = ticker.tick() => printed += print_results(session)?,
        }
    }
}

/// Write every queued result to stdout as one JSON line each.
fn print_results(session: &Session) -> Result<usize> {
    let results = session.drain_results();
    if results.is_empty() {
        return Ok(0);
    }

    let mut stdout = std::io::stdout().lock();
    for result in &results {
        let line = serde_json::to_string(result).context("Failed to serialize result")?;
        writeln!(stdout, "{line}").context("Failed to write result")?;
    }
    stdout.flush().context("Failed to flush stdout")?;

    Ok(results.len())
}

/// Restart the session after the relay drops it, until shutdown.
///
/// With no delay configured a dropped connection ends the program.
async fn reconnect_on_drop(
    session: Arc<Session>,
    delay: Option<Duration>,
    shutdown: CancellationToken,
) {
    let mut state_rx = session.watch_state();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let state = *state_rx.borrow_and_update();
        match state {
            SessionState::Disconnected => {
                let Some(delay) = delay else {
                    tracing::warn!(
                        "Relay connection lost ({}), reconnect disabled",
                        session.last_error().unwrap_or_else(|| "closed".to_string())
                    );
                    shutdown.cancel();
                    return;
                };

                tracing::warn!(
                    "Relay connection lost ({}), reconnecting in {:?}",
                    session.last_error().unwrap_or_else(|| "closed".to_string()),
                    delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = session.start() {
                    tracing::debug!("Reconnect skipped: {}", e);
                }
            }
            SessionState::Closed => return,
            SessionState::Connecting | SessionState::Connected | SessionState::Closing => {}
        }
    }
}
