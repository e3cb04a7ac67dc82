//! Relay connection session.
//!
//! A [`Session`] owns one WebSocket connection to a relay and three kinds of
//! background work:
//!
//! - the connection task, which reads frames and hands them to the
//!   [`CorrelationCache`], queueing paired results and transmitting the
//!   profile requests the cache asks for;
//! - the writer half of the same task, which drains an outbound channel so
//!   transmitting never holds the cache lock or stalls the reader;
//! - keepalive tickers started with [`Session::send_periodic`].
//!
//! # State machine
//!
//! ```text
//!  Disconnected ──start()──► Connecting ──handshake──► Connected
//!       ▲                        │                        │
//!       └──── connect failure ───┘                        │
//!       └──────────────── transport error / remote close ─┘
//!
//!  Connecting | Connected ──stop()──► Closing ──► Closed
//! ```
//!
//! Reconnecting is the caller's decision: `start()` may be called again once
//! the session is back in `Disconnected`. `stop()` is final.

use crate::cache::{CorrelatedResult, CorrelationCache};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::queue::ResultQueue;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relaytail_core::{RequestFrame, build_feed_request};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the close handshake to flush on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; `start()` may be called.
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Connected and dispatching frames.
    Connected,
    /// `stop()` called, transport closing.
    Closing,
    /// Stopped for good.
    Closed,
}

/// Why the connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Stopped,
    RemoteClosed,
    TransportError,
}

/// State shared between the session handle and its background tasks.
struct Shared {
    cache: Arc<CorrelationCache>,
    queue: Arc<ResultQueue>,
    state: watch::Sender<SessionState>,
    /// Sender into the writer of the current connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Frames re-sent periodically; also sent right after every (re)connect.
    keepalive: Mutex<Vec<RequestFrame>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "session state changed");
        }
        let connected = if next == SessionState::Connected { 1.0 } else { 0.0 };
        metrics::gauge!("feed_connected").set(connected);
    }

    fn record_error(&self, error: String) {
        metrics::counter!("feed_transport_errors_total").increment(1);
        *self.last_error.lock() = Some(error);
    }

    fn send(&self, frame: &RequestFrame) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(Message::text(frame.to_json()))
            .map_err(|_| Error::NotConnected)
    }

    /// Feed one inbound text frame through the cache.
    fn dispatch(&self, raw: &str, tx: &mpsc::UnboundedSender<Message>) {
        let outcome = self.cache.handle_inbound(raw);

        if let Some(result) = outcome.emit {
            self.queue.enqueue(result);
        }

        if let Some(request) = outcome.request
            && tx.send(Message::text(request.to_json())).is_err()
        {
            debug!(label = %request.label, "writer gone, profile request dropped");
        }
    }
}

/// A client session against a single relay.
pub struct Session {
    config: SessionConfig,
    url: Url,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Session {
    /// Create a session. Nothing is connected until [`start`](Self::start).
    pub fn new(config: SessionConfig) -> Result<Self> {
        let url = config.validate()?;
        let cache = Arc::new(CorrelationCache::new(config.classifier));
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            config,
            url,
            shared: Arc::new(Shared {
                cache,
                queue: Arc::new(ResultQueue::new()),
                state,
                outbound: Mutex::new(None),
                keepalive: Mutex::new(Vec::new()),
                last_error: Mutex::new(None),
            }),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// The feed subscription for this session.
    pub fn feed_request(&self) -> RequestFrame {
        build_feed_request(&self.config.session_id)
    }

    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.shared.cache
    }

    pub fn queue(&self) -> &Arc<ResultQueue> {
        &self.shared.queue
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Most recent transport error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Begin connecting in the background.
    ///
    /// Returns immediately; use [`wait_until_connected`](Self::wait_until_connected)
    /// or [`watch_state`](Self::watch_state) to follow progress.
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut result = Ok(());
        self.shared.state.send_if_modified(|state| match *state {
            SessionState::Disconnected => {
                *state = SessionState::Connecting;
                true
            }
            SessionState::Connecting | SessionState::Connected => {
                result = Err(Error::AlreadyRunning);
                false
            }
            SessionState::Closing | SessionState::Closed => {
                result = Err(Error::Closed);
                false
            }
        });
        result?;

        info!(url = %self.url, session = %self.config.session_id, "connecting to relay");

        let shared = Arc::clone(&self.shared);
        let url = self.url.clone();
        let connect_timeout = self.config.connect_timeout;
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            run_connection(shared, url, connect_timeout, shutdown).await;
        });

        Ok(())
    }

    /// Wait until the connection is open.
    ///
    /// Keeps waiting through failed attempts (the caller may be
    /// reconnecting); returns [`Error::Closed`] once the session is stopped.
    pub async fn wait_until_connected(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed))
            .await
            .map_err(|_| Error::Closed)?;

        match *state {
            SessionState::Connected => Ok(()),
            _ => Err(Error::Closed),
        }
    }

    /// Queue a request frame for transmission.
    ///
    /// Fails with [`Error::NotConnected`] when no connection is open.
    pub fn send(&self, frame: &RequestFrame) -> Result<()> {
        self.shared.send(frame)
    }

    /// Re-send `frame` every `interval` until the session is stopped.
    ///
    /// The first send happens immediately. The frame is also sent right after
    /// every reconnect. Sends while disconnected are skipped.
    pub fn send_periodic(&self, frame: RequestFrame, interval: Duration) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        if interval.is_zero() {
            return Err(Error::Config(
                "periodic send interval must be greater than zero".to_string(),
            ));
        }

        self.shared.keepalive.lock().push(frame.clone());

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match shared.send(&frame) {
                            Ok(()) => debug!(label = %frame.label, "keepalive sent"),
                            Err(e) => debug!(label = %frame.label, error = %e, "keepalive skipped"),
                        }
                    }
                }
            }
            debug!(label = %frame.label, "keepalive stopped");
        });

        Ok(())
    }

    /// Take every result paired since the last drain.
    pub fn drain_results(&self) -> Vec<CorrelatedResult> {
        self.shared.queue.drain_all()
    }

    /// Stop all background work and close the connection.
    ///
    /// Idempotent; returns once every task has finished.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(session = %self.config.session_id, "stopping session");
        }

        self.shared.state.send_if_modified(|state| match *state {
            SessionState::Connecting | SessionState::Connected => {
                *state = SessionState::Closing;
                true
            }
            _ => false,
        });

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        *self.shared.outbound.lock() = None;
        if self.state() != SessionState::Closed {
            self.shared.set_state(SessionState::Closed);
        }
    }
}

impl Drop for Session {
    /// Cancel background tasks of a session dropped without `stop()`.
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connect, run the read/write loops until the connection ends, then record
/// the resulting state.
async fn run_connection(
    shared: Arc<Shared>,
    url: Url,
    connect_timeout: Duration,
    shutdown: CancellationToken,
) {
    let connect = tokio::time::timeout(connect_timeout, connect_async(url.as_str()));

    let ws = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            shared.set_state(SessionState::Closed);
            return;
        }
        result = connect => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "failed to connect to relay");
                shared.record_error(Error::from(e).to_string());
                shared.set_state(SessionState::Disconnected);
                return;
            }
            Err(_) => {
                warn!(url = %url, timeout = ?connect_timeout, "relay connection timed out");
                shared.record_error(Error::ConnectTimeout(connect_timeout).to_string());
                shared.set_state(SessionState::Disconnected);
                return;
            }
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for frame in shared.keepalive.lock().iter() {
        let _ = tx.send(Message::text(frame.to_json()));
    }
    *shared.outbound.lock() = Some(tx.clone());
    *shared.last_error.lock() = None;
    shared.set_state(SessionState::Connected);
    info!(url = %url, "connected to relay");

    let end = tokio::select! {
        biased;
        _ = shutdown.cancelled() => LoopEnd::Stopped,
        end = write_frames(&shared, &mut sink, &mut rx) => end,
        end = read_frames(&shared, &mut stream, &tx) => end,
    };

    *shared.outbound.lock() = None;

    match end {
        LoopEnd::Stopped => {
            shared.set_state(SessionState::Closing);
            let close = async {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                debug!(url = %url, "close handshake timed out");
            }
            shared.set_state(SessionState::Closed);
            info!(url = %url, "relay connection closed");
        }
        LoopEnd::RemoteClosed | LoopEnd::TransportError => {
            shared.set_state(SessionState::Disconnected);
            warn!(url = %url, reason = ?end, "relay connection lost");
        }
    }
}

/// Drain the outbound channel into the socket.
async fn write_frames(
    shared: &Shared,
    sink: &mut SplitSink<WsStream, Message>,
    rx: &mut mpsc::UnboundedReceiver<Message>,
) -> LoopEnd {
    // The connection task holds a sender, so `recv` only yields `None` if
    // that task is gone.
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "failed to send frame");
            shared.record_error(e.to_string());
            return LoopEnd::TransportError;
        }
    }
    LoopEnd::Stopped
}

/// Read frames until the relay closes the connection or the transport fails.
async fn read_frames(
    shared: &Shared,
    stream: &mut SplitStream<WsStream>,
    tx: &mpsc::UnboundedSender<Message>,
) -> LoopEnd {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => shared.dispatch(text.as_str(), tx),
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "relay closed connection");
                return LoopEnd::RemoteClosed;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "WebSocket receive error");
                shared.record_error(e.to_string());
                return LoopEnd::TransportError;
            }
        }
    }
    LoopEnd::RemoteClosed
}
