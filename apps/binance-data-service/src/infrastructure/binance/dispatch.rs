//! Feed Event Dispatcher
//!
//! Drains [`FeedEvent`]s from the stream client, tracks the connection
//! state for the health endpoint and hands decoded market events to the
//! multiplexer.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;

use super::codec::{self, Frame};
use crate::application::ports::FeedEvent;
use crate::application::services::multiplexer::{Dispatch, DropReason, Multiplexer};
use crate::infrastructure::metrics;

// =============================================================================
// Feed Status
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeedState {
    /// No connection wanted yet.
    Idle = 0,
    /// Connected.
    Connected = 1,
    /// Waiting to reconnect.
    Reconnecting = 2,
    /// Connection lost or closed.
    Disconnected = 3,
}

impl FeedState {
    /// State label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Reconnecting,
            3 => Self::Disconnected,
            _ => Self::Idle,
        }
    }
}

/// Lock-free connection status shared with the health server.
#[derive(Debug, Default)]
pub struct FeedStatus {
    state: AtomicU8,
    reconnects: AtomicU64,
    messages: AtomicU64,
    last_message_ms: AtomicI64,
}

impl FeedStatus {
    /// Fresh status in the idle state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reconnection attempts so far.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Text frames received so far.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Epoch milliseconds of the last frame, if any.
    #[must_use]
    pub fn last_message_ms(&self) -> Option<i64> {
        let ms = self.last_message_ms.load(Ordering::Relaxed);
        (ms > 0).then_some(ms)
    }

    fn set_state(&self, state: FeedState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Feed event consumer.
pub struct FeedDispatcher {
    events: mpsc::Receiver<FeedEvent>,
    multiplexer: Arc<Multiplexer>,
    status: Arc<FeedStatus>,
}

impl FeedDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        events: mpsc::Receiver<FeedEvent>,
        multiplexer: Arc<Multiplexer>,
        status: Arc<FeedStatus>,
    ) -> Self {
        Self {
            events,
            multiplexer,
            status,
        }
    }

    /// Run until every event sender is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        tracing::debug!("Feed dispatcher stopped");
    }

    /// Apply one event.
    pub fn handle(&self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => {
                self.status.set_state(FeedState::Connected);
                tracing::info!("Market stream connected");
            }
            FeedEvent::Disconnected => {
                self.status.set_state(FeedState::Disconnected);
                tracing::info!("Market stream disconnected");
            }
            FeedEvent::Reconnecting { attempt } => {
                self.status.set_state(FeedState::Reconnecting);
                self.status.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::info!(attempt, "Market stream reconnecting");
            }
            FeedEvent::Error(msg) => {
                tracing::error!(error = %msg, "Market stream error");
            }
            FeedEvent::Message(text) => self.on_message(&text),
        }
    }

    fn on_message(&self, text: &str) {
        self.status.record_message();

        match codec::decode(text) {
            Ok(Frame::Event { stream, event }) => {
                metrics::record_event_received();
                let outcome = self.multiplexer.dispatch(&stream, &event, text);
                tracing::trace!(stream = %stream, kind = event.kind(), ?outcome, "Event dispatched");
                if let Dispatch::Delivered { dropped, .. } = outcome
                    && dropped > 0
                {
                    tracing::debug!(stream = %stream, dropped, "Event dropped for slow sinks");
                }
            }
            Ok(Frame::Ack { id }) => {
                tracing::debug!(id, "Stream command acknowledged");
            }
            Ok(Frame::Rejected { id, code, msg }) => {
                tracing::warn!(?id, code, msg = %msg, "Stream command rejected");
            }
            Err(e) => {
                metrics::record_events_dropped(DropReason::Malformed, 1);
                tracing::warn!(error = %e, "Failed to decode stream frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::ports::MockMarketStream;
    use crate::application::services::multiplexer::Sink;
    use crate::domain::channel::ChannelKey;

    const CLOSED_KLINE: &str =
        r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"x":true}}}"#;
    const FORMING_KLINE: &str =
        r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"x":false}}}"#;

    fn subscribed_multiplexer() -> (Arc<Multiplexer>, Sink, mpsc::Receiver<String>) {
        let mut feed = MockMarketStream::new();
        feed.expect_open().times(1).returning(|_| Ok(()));
        feed.expect_close().returning(|| Ok(()));
        let mux = Arc::new(Multiplexer::new(Arc::new(feed)));

        let (sink, rx) = Sink::new(1, 8);
        mux.subscribe(&ChannelKey::kline("BTCUSDT", "1m").unwrap(), &sink)
            .unwrap();
        (mux, sink, rx)
    }

    fn dispatcher(mux: Arc<Multiplexer>) -> (mpsc::Sender<FeedEvent>, FeedDispatcher, Arc<FeedStatus>) {
        let (tx, rx) = mpsc::channel(16);
        let status = Arc::new(FeedStatus::new());
        (tx, FeedDispatcher::new(rx, mux, Arc::clone(&status)), status)
    }

    #[test]
    fn closed_kline_is_forwarded_verbatim() {
        let (mux, _sink, mut rx) = subscribed_multiplexer();
        let (_tx, dispatcher, status) = dispatcher(mux);

        dispatcher.handle(FeedEvent::Message(FORMING_KLINE.into()));
        dispatcher.handle(FeedEvent::Message(CLOSED_KLINE.into()));

        assert_eq!(rx.try_recv().unwrap(), CLOSED_KLINE);
        assert!(rx.try_recv().is_err());
        assert_eq!(status.messages(), 2);
        assert!(status.last_message_ms().is_some());
    }

    #[test]
    fn replies_and_garbage_reach_no_sink() {
        let (mux, _sink, mut rx) = subscribed_multiplexer();
        let (_tx, dispatcher, _status) = dispatcher(mux);

        dispatcher.handle(FeedEvent::Message(r#"{"result":null,"id":1}"#.into()));
        dispatcher.handle(FeedEvent::Message("{oops".into()));
        dispatcher.handle(FeedEvent::Message(
            r#"{"stream":"ethusdt@kline_1m","data":{"e":"kline","k":{"x":true}}}"#.into(),
        ));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connection_events_update_state() {
        let (mux, _sink, _rx) = subscribed_multiplexer();
        let (_tx, dispatcher, status) = dispatcher(mux);

        assert_eq!(status.state(), FeedState::Idle);
        dispatcher.handle(FeedEvent::Connected);
        assert_eq!(status.state(), FeedState::Connected);
        dispatcher.handle(FeedEvent::Disconnected);
        dispatcher.handle(FeedEvent::Reconnecting { attempt: 1 });
        assert_eq!(status.state(), FeedState::Reconnecting);
        assert_eq!(status.reconnects(), 1);
        assert_eq!(status.state().as_str(), "reconnecting");
    }

    #[tokio::test]
    async fn run_ends_when_senders_drop() {
        let (mux, _sink, mut rx) = subscribed_multiplexer();
        let (tx, dispatcher, status) = dispatcher(mux);
        let task = tokio::spawn(dispatcher.run());

        tx.send(FeedEvent::Connected).await.unwrap();
        tx.send(FeedEvent::Message(CLOSED_KLINE.into())).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state(), FeedState::Connected);
        assert_eq!(rx.try_recv().unwrap(), CLOSED_KLINE);
    }
}
