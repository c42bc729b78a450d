//! Downstream Sessions
//!
//! One session per `GetSocketData` stream. A session runs two loops
//! concurrently:
//!
//! - **receive**: applies the client's subscribe/unsubscribe requests to the
//!   multiplexer, in order
//! - **send**: drains the session's sink into the client stream
//!
//! Either loop ending (client EOF, read error, client gone, or an explicit
//! stop) cancels the session's token, which the other loop observes. After
//! both loops return the session removes its sink from every channel. The
//! session is consumed by [`Session::run`], so that cleanup runs once.
//!
//! The [`SessionRegistry`] tracks running sessions for shutdown: it stops
//! accepting new ones, cancels the rest and waits for them within a grace
//! period.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use metrics::gauge;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::multiplexer::{Multiplexer, Sink};
use crate::domain::channel::ChannelKey;
use crate::domain::session::{SessionId, SessionState};

/// Default per-session sink capacity.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

#[allow(clippy::cast_precision_loss)]
fn set_sessions(count: usize) {
    gauge!("data_service_sessions").set(count as f64);
}

// =============================================================================
// Requests
// =============================================================================

/// One client request on a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Trading symbol.
    pub symbol: String,
    /// Kline interval.
    pub interval: String,
    /// `true` to subscribe, `false` to unsubscribe.
    pub subscribe: bool,
}

// =============================================================================
// Session Control
// =============================================================================

/// Handle for observing and stopping a session from outside its task.
#[derive(Debug, Clone)]
pub struct SessionControl {
    id: SessionId,
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl SessionControl {
    fn new(id: SessionId, token: CancellationToken) -> Self {
        Self {
            id,
            token,
            state: Arc::new(AtomicU8::new(SessionState::Open.as_u8())),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Signal both loops to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.advance(SessionState::Draining);
        self.token.cancel();
    }

    /// Move forward to `next` if that is a legal transition.
    fn advance(&self, next: SessionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                SessionState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next.as_u8())
            })
            .is_ok()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A single downstream stream.
pub struct Session {
    control: SessionControl,
    multiplexer: Arc<Multiplexer>,
    sink_capacity: usize,
}

impl Session {
    /// Create a session whose stop signal is `token`.
    #[must_use]
    pub fn new(
        id: SessionId,
        multiplexer: Arc<Multiplexer>,
        sink_capacity: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            control: SessionControl::new(id, token),
            multiplexer,
            sink_capacity,
        }
    }

    /// Control handle for this session.
    #[must_use]
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Run both loops to completion, then release every subscription.
    ///
    /// `wrap` turns a raw event payload into the outbound item.
    pub async fn run<S, E, O>(self, inbound: S, outbound: mpsc::Sender<O>, wrap: fn(String) -> O)
    where
        S: Stream<Item = Result<ChannelRequest, E>> + Unpin + Send,
        E: Display + Send,
        O: Send,
    {
        let id = self.control.id();
        let (sink, sink_rx) = Sink::new(id, self.sink_capacity);

        self.control.advance(SessionState::Streaming);
        tracing::info!(session_id = id, "Session started");

        tokio::join!(
            self.receive_loop(inbound, &sink),
            self.send_loop(sink_rx, outbound, wrap),
        );

        let released = self.multiplexer.remove_session(id);
        drop(sink);
        self.control.advance(SessionState::Closed);

        tracing::info!(
            session_id = id,
            released_channels = released.len(),
            "Session closed"
        );
    }

    async fn receive_loop<S, E>(&self, mut inbound: S, sink: &Sink)
    where
        S: Stream<Item = Result<ChannelRequest, E>> + Unpin,
        E: Display + Send,
    {
        let id = self.control.id();

        loop {
            tokio::select! {
                () = self.control.token.cancelled() => break,
                item = inbound.next() => match item {
                    Some(Ok(request)) => self.apply(&request, sink),
                    Some(Err(e)) => {
                        tracing::debug!(session_id = id, error = %e, "Session read failed");
                        break;
                    }
                    None => {
                        tracing::debug!(session_id = id, "Client closed request stream");
                        break;
                    }
                },
            }
        }

        self.control.stop();
    }

    async fn send_loop<O>(
        &self,
        mut sink_rx: mpsc::Receiver<String>,
        outbound: mpsc::Sender<O>,
        wrap: fn(String) -> O,
    ) {
        let id = self.control.id();

        loop {
            let payload = tokio::select! {
                () = self.control.token.cancelled() => break,
                payload = sink_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            tokio::select! {
                () = self.control.token.cancelled() => break,
                sent = outbound.send(wrap(payload)) => {
                    if sent.is_err() {
                        tracing::debug!(session_id = id, "Client stream gone");
                        break;
                    }
                }
            }
        }

        self.control.stop();
    }

    fn apply(&self, request: &ChannelRequest, sink: &Sink) {
        let id = self.control.id();

        let channel = match ChannelKey::kline(&request.symbol, &request.interval) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "Ignoring invalid channel request");
                return;
            }
        };

        if request.subscribe {
            if let Err(e) = self.multiplexer.subscribe(&channel, sink) {
                tracing::warn!(session_id = id, channel = %channel, error = %e, "Subscribe failed");
            }
        } else {
            self.multiplexer.unsubscribe(&channel, sink.id());
        }
    }
}

// =============================================================================
// Session Registry
// =============================================================================

/// Session registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// New sessions are no longer accepted.
    #[error("service is shutting down")]
    ShuttingDown,
}

/// Spawns and tracks sessions for ordered shutdown.
#[derive(Debug)]
pub struct SessionRegistry {
    multiplexer: Arc<Multiplexer>,
    sink_capacity: usize,
    tracker: TaskTracker,
    sessions_token: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl SessionRegistry {
    /// Create a registry whose sessions share `multiplexer`.
    #[must_use]
    pub fn new(multiplexer: Arc<Multiplexer>, sink_capacity: usize) -> Self {
        Self {
            multiplexer,
            sink_capacity,
            tracker: TaskTracker::new(),
            sessions_token: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start a session on its own task.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ShuttingDown`] once [`close`](Self::close)
    /// has been called.
    pub fn spawn<S, E, O>(
        &self,
        inbound: S,
        outbound: mpsc::Sender<O>,
        wrap: fn(String) -> O,
    ) -> Result<SessionControl, SessionError>
    where
        S: Stream<Item = Result<ChannelRequest, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        O: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(SessionError::ShuttingDown);
        }

        let id = uuid::Uuid::new_v4().as_u64_pair().0;
        let session = Session::new(
            id,
            Arc::clone(&self.multiplexer),
            self.sink_capacity,
            self.sessions_token.child_token(),
        );
        let control = session.control();

        let active = Arc::clone(&self.active);
        set_sessions(active.fetch_add(1, Ordering::AcqRel) + 1);

        self.tracker.spawn(async move {
            session.run(inbound, outbound, wrap).await;
            set_sessions(active.fetch_sub(1, Ordering::AcqRel) - 1);
        });

        Ok(control)
    }

    /// Stop accepting new sessions.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Whether new sessions are refused.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stop accepting, signal every session to drain, and wait up to
    /// `grace` for them to finish.
    ///
    /// Returns `true` if every session exited in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        self.sessions_token.cancel();

        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();

        if drained {
            tracing::info!("All sessions drained");
        } else {
            tracing::warn!(
                remaining = self.active_sessions(),
                grace_secs = grace.as_secs_f64(),
                "Session drain timed out"
            );
        }
        drained
    }

    /// Number of sessions still running.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================
