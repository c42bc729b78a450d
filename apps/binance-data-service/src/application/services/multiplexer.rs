//! Subscription Multiplexer
//!
//! Shares one upstream kline subscription per channel across any number of
//! downstream sessions. The multiplexer is the only place that decides
//! when the exchange stream is opened, extended, trimmed or closed.
//!
//! # Locking
//!
//! Table mutation and the upstream command it implies happen under one
//! mutex, so "channel became empty, unsubscribe upstream" is atomic with
//! respect to a concurrent subscribe on the same channel. Upstream calls
//! only enqueue a command for the connection task and never block on I/O.
//! Dispatch takes the same lock and uses `try_send`, so a slow session
//! cannot stall delivery to the others.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::application::ports::{FeedError, MarketStream};
use crate::domain::channel::ChannelKey;
use crate::domain::event::StreamEvent;
use crate::domain::subscription::{Insertion, Removal, SinkId, SubscriptionTable};

// =============================================================================
// Sink
// =============================================================================

/// Per-session delivery conduit.
///
/// The session owns the sink and its receiver; the multiplexer keeps only
/// a weak sender, so a finished session's buffer is freed as soon as the
/// session drops it.
#[derive(Debug)]
pub struct Sink {
    id: SinkId,
    tx: mpsc::Sender<String>,
}

impl Sink {
    /// Create a bounded sink and its receiving end.
    #[must_use]
    pub fn new(id: SinkId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    /// Sink identifier.
    #[must_use]
    pub const fn id(&self) -> SinkId {
        self.id
    }

    fn downgrade(&self) -> mpsc::WeakSender<String> {
        self.tx.downgrade()
    }
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Why an event did not reach a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Stream name not in the subscription table.
    UnknownStream,
    /// Payload could not be decoded.
    Malformed,
    /// Kline still forming, or a non-kline event.
    NotForwardable,
    /// Sink buffer was full.
    SinkFull,
}

impl DropReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownStream => "unknown_stream",
            Self::Malformed => "malformed",
            Self::NotForwardable => "not_forwardable",
            Self::SinkFull => "sink_full",
        }
    }
}

/// Upstream subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOp {
    /// Connect with a first channel.
    Open,
    /// Add a channel.
    Subscribe,
    /// Remove a channel.
    Unsubscribe,
    /// Disconnect.
    Close,
}

impl UpstreamOp {
    /// Operation label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Close => "close",
        }
    }
}

fn record_dropped(reason: DropReason, count: usize) {
    counter!("data_service_events_dropped_total", "reason" => reason.as_str())
        .increment(count as u64);
}

fn record_upstream_call(op: UpstreamOp) {
    counter!("data_service_upstream_calls_total", "op" => op.as_str()).increment(1);
}

#[allow(clippy::cast_precision_loss)]
fn set_channels(count: usize) {
    gauge!("data_service_channels").set(count as f64);
}

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Multiplexer errors.
#[derive(Debug, Error)]
pub enum MultiplexerError {
    /// The upstream refused the command; the table was left unchanged.
    #[error("upstream {} failed for {channel}: {source}", .op.as_str())]
    Upstream {
        /// Command that failed.
        op: UpstreamOp,
        /// Channel being added.
        channel: ChannelKey,
        /// Port error.
        #[source]
        source: FeedError,
    },

    /// The multiplexer has been shut down.
    #[error("multiplexer is shut down")]
    ShutDown,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No sink wants this stream.
    UnknownStream,
    /// The event is not forwarded (forming kline or other kind).
    Filtered,
    /// Fan-out ran.
    Delivered {
        /// Sinks that accepted the payload.
        delivered: usize,
        /// Sinks whose buffer was full.
        dropped: usize,
    },
}

/// Point-in-time multiplexer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Channels subscribed upstream.
    pub channels: usize,
    /// Sinks with at least one channel.
    pub sinks: usize,
    /// Total (channel, sink) registrations.
    pub registrations: usize,
    /// Whether the upstream connection is open.
    pub upstream_open: bool,
}

// =============================================================================
// Multiplexer
// =============================================================================

#[derive(Default)]
struct Inner {
    table: SubscriptionTable,
    sinks: HashMap<SinkId, mpsc::WeakSender<String>>,
    upstream_open: bool,
    shut_down: bool,
}

/// Fans one upstream feed out to many session sinks.
pub struct Multiplexer {
    feed: Arc<dyn MarketStream>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create a multiplexer driving `feed`.
    #[must_use]
    pub fn new(feed: Arc<dyn MarketStream>) -> Self {
        Self {
            feed,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register `sink` under `channel`.
    ///
    /// The first sink on a channel subscribes it upstream before it is
    /// registered, opening the connection if nothing else is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream command fails or the multiplexer
    /// is shut down. The table is unchanged in both cases.
    pub fn subscribe(
        &self,
        channel: &ChannelKey,
        sink: &Sink,
    ) -> Result<Insertion, MultiplexerError> {
        let mut inner = self.inner.lock();

        if inner.shut_down {
            return Err(MultiplexerError::ShutDown);
        }
        if inner.table.is_registered(channel, sink.id()) {
            return Ok(Insertion::AlreadyRegistered);
        }
        if inner.table.sinks(channel.as_str()).is_none() {
            self.acquire_upstream(&mut inner, channel)?;
        }

        let insertion = inner.table.insert(channel, sink.id());
        inner
            .sinks
            .entry(sink.id())
            .or_insert_with(|| sink.downgrade());

        set_channels(inner.table.stats().channel_count);
        tracing::debug!(sink_id = sink.id(), channel = %channel, ?insertion, "Sink subscribed");

        Ok(insertion)
    }

    /// Deregister `sink` from `channel`.
    ///
    /// The last sink out unsubscribes the channel upstream; the last
    /// channel out closes the connection.
    pub fn unsubscribe(&self, channel: &ChannelKey, sink: SinkId) -> Removal {
        let mut inner = self.inner.lock();

        let removal = inner.table.remove(channel, sink);
        if removal == Removal::ChannelEmptied {
            self.release_upstream(&inner, channel);
            self.close_if_idle(&mut inner);
        }
        if !inner.table.has_sink(sink) {
            inner.sinks.remove(&sink);
        }

        set_channels(inner.table.stats().channel_count);
        tracing::debug!(sink_id = sink, channel = %channel, ?removal, "Sink unsubscribed");

        removal
    }

    /// Deliver `payload` to every sink on `channel`.
    ///
    /// Only closed klines are forwarded. Full sinks lose this event; other
    /// sinks are unaffected.
    pub fn dispatch(&self, channel: &str, event: &StreamEvent, payload: &str) -> Dispatch {
        let inner = self.inner.lock();

        let Some(sink_ids) = inner.table.sinks(channel) else {
            tracing::warn!(stream = channel, "Unknown stream, dropping event");
            record_dropped(DropReason::UnknownStream, 1);
            return Dispatch::UnknownStream;
        };

        if !event.is_forwardable() {
            if let StreamEvent::Other(kind) = event {
                tracing::warn!(stream = channel, kind = %kind, "Unexpected event kind");
            }
            record_dropped(DropReason::NotForwardable, 1);
            return Dispatch::Filtered;
        }

        let mut delivered = 0;
        let mut dropped = 0;

        for sink_id in sink_ids {
            let Some(tx) = inner.sinks.get(sink_id).and_then(mpsc::WeakSender::upgrade) else {
                continue;
            };
            match tx.try_send(payload.to_owned()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::warn!(sink_id, stream = channel, "Sink full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(sink_id, stream = channel, "Sink closed, skipping");
                }
            }
        }

        counter!("data_service_events_forwarded_total").increment(delivered as u64);
        if dropped > 0 {
            record_dropped(DropReason::SinkFull, dropped);
        }

        Dispatch::Delivered { delivered, dropped }
    }

    /// Deregister `sink` from every channel.
    ///
    /// Returns the channels that were unsubscribed upstream as a result.
    /// A second call for the same sink does nothing.
    pub fn remove_session(&self, sink: SinkId) -> Vec<ChannelKey> {
        let mut inner = self.inner.lock();

        inner.sinks.remove(&sink);
        let emptied = inner.table.remove_sink(sink);

        for channel in &emptied {
            self.release_upstream(&inner, channel);
        }
        if !emptied.is_empty() {
            self.close_if_idle(&mut inner);
        }

        set_channels(inner.table.stats().channel_count);
        emptied
    }

    /// Refuse further subscriptions and close the upstream connection.
    ///
    /// Returns the channels that were still live.
    pub fn shutdown(&self) -> Vec<ChannelKey> {
        let mut inner = self.inner.lock();

        inner.shut_down = true;
        inner.sinks.clear();
        let remaining = inner.table.clear();

        if inner.upstream_open {
            self.close_upstream(&mut inner);
        }

        set_channels(0);
        tracing::info!(channels = remaining.len(), "Multiplexer shut down");
        remaining
    }

    /// Channels currently subscribed upstream, sorted.
    #[must_use]
    pub fn active_channels(&self) -> Vec<ChannelKey> {
        self.inner.lock().table.active_channels()
    }

    /// Channels a sink is registered under, sorted.
    #[must_use]
    pub fn channels_of(&self, sink: SinkId) -> Vec<ChannelKey> {
        self.inner.lock().table.channels_of(sink)
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let inner = self.inner.lock();
        let table = inner.table.stats();
        MultiplexerStats {
            channels: table.channel_count,
            sinks: table.sink_count,
            registrations: table.registration_count,
            upstream_open: inner.upstream_open,
        }
    }

    // =========================================================================
    // Upstream transitions (lock held)
    // =========================================================================

    fn acquire_upstream(
        &self,
        inner: &mut Inner,
        channel: &ChannelKey,
    ) -> Result<(), MultiplexerError> {
        let (op, result) = if inner.upstream_open {
            (UpstreamOp::Subscribe, self.feed.subscribe(channel))
        } else {
            (UpstreamOp::Open, self.feed.open(channel))
        };

        result.map_err(|source| MultiplexerError::Upstream {
            op,
            channel: channel.clone(),
            source,
        })?;

        inner.upstream_open = true;
        record_upstream_call(op);
        tracing::info!(channel = %channel, op = op.as_str(), "Upstream channel added");
        Ok(())
    }

    fn release_upstream(&self, inner: &Inner, channel: &ChannelKey) {
        if !inner.upstream_open {
            return;
        }
        record_upstream_call(UpstreamOp::Unsubscribe);
        match self.feed.unsubscribe(channel) {
            Ok(()) => tracing::info!(channel = %channel, "Upstream channel removed"),
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Upstream unsubscribe failed"),
        }
    }

    fn close_if_idle(&self, inner: &mut Inner) {
        if inner.upstream_open && inner.table.is_empty() {
            self.close_upstream(inner);
        }
    }

    fn close_upstream(&self, inner: &mut Inner) {
        inner.upstream_open = false;
        record_upstream_call(UpstreamOp::Close);
        match self.feed.close() {
            Ok(()) => tracing::info!("Upstream closed, no channels left"),
            Err(e) => tracing::warn!(error = %e, "Upstream close failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::application::ports::MockMarketStream;

    #[test]
    fn metric_labels() {
        assert_eq!(DropReason::UnknownStream.as_str(), "unknown_stream");
        assert_eq!(DropReason::Malformed.as_str(), "malformed");
        assert_eq!(DropReason::NotForwardable.as_str(), "not_forwardable");
        assert_eq!(DropReason::SinkFull.as_str(), "sink_full");
        assert_eq!(UpstreamOp::Open.as_str(), "open");
        assert_eq!(UpstreamOp::Subscribe.as_str(), "subscribe");
        assert_eq!(UpstreamOp::Unsubscribe.as_str(), "unsubscribe");
        assert_eq!(UpstreamOp::Close.as_str(), "close");
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Open(String),
        Subscribe(String),
        Unsubscribe(String),
        Close,
    }

    #[derive(Default)]
    struct RecordingStream {
        calls: parking_lot::Mutex<Vec<Call>>,
    }

    impl RecordingStream {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    impl MarketStream for RecordingStream {
        fn open(&self, channel: &ChannelKey) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Open(channel.to_string()));
            Ok(())
        }

        fn subscribe(&self, channel: &ChannelKey) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Subscribe(channel.to_string()));
            Ok(())
        }

        fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Unsubscribe(channel.to_string()));
            Ok(())
        }

        fn close(&self) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Close);
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingStream>, Multiplexer) {
        let stream = Arc::new(RecordingStream::default());
        let mux = Multiplexer::new(Arc::clone(&stream) as Arc<dyn MarketStream>);
        (stream, mux)
    }

    fn key(symbol: &str) -> ChannelKey {
        ChannelKey::kline(symbol, "1m").unwrap()
    }

    const CLOSED: StreamEvent = StreamEvent::Kline { closed: true };
    const FORMING: StreamEvent = StreamEvent::Kline { closed: false };

    #[test]
    fn first_channel_opens_upstream() {
        let (stream, mux) = setup();
        let (sink, _rx) = Sink::new(1, 8);

        let insertion = mux.subscribe(&key("BTCUSDT"), &sink).unwrap();

        assert_eq!(insertion, Insertion::FirstSink);
        assert_eq!(stream.calls(), vec![Call::Open("btcusdt@kline_1m".into())]);
        assert!(mux.stats().upstream_open);
    }

    #[test]
    fn second_channel_subscribes_on_open_connection() {
        let (stream, mux) = setup();
        let (sink, _rx) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &sink).unwrap();
        mux.subscribe(&key("ETHUSDT"), &sink).unwrap();

        assert_eq!(
            stream.calls(),
            vec![
                Call::Open("btcusdt@kline_1m".into()),
                Call::Subscribe("ethusdt@kline_1m".into()),
            ]
        );
    }

    #[test]
    fn shared_channel_subscribes_upstream_once() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);
        let (b, _rb) = Sink::new(2, 8);

        assert_eq!(mux.subscribe(&key("BTCUSDT"), &a).unwrap(), Insertion::FirstSink);
        assert_eq!(mux.subscribe(&key("BTCUSDT"), &b).unwrap(), Insertion::Joined);

        assert_eq!(stream.calls().len(), 1);
        assert_eq!(mux.stats().registrations, 2);
    }

    #[test]
    fn duplicate_subscribe_is_noop() {
        let (stream, mux) = setup();
        let (sink, _rx) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &sink).unwrap();
        let again = mux.subscribe(&key("BTCUSDT"), &sink).unwrap();

        assert_eq!(again, Insertion::AlreadyRegistered);
        assert_eq!(stream.calls().len(), 1);
    }

    #[test]
    fn last_unsubscribe_releases_channel_and_closes() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);
        let (b, _rb) = Sink::new(2, 8);
        let btc = key("BTCUSDT");

        mux.subscribe(&btc, &a).unwrap();
        mux.subscribe(&btc, &b).unwrap();

        assert_eq!(mux.unsubscribe(&btc, 1), Removal::Remaining(1));
        assert_eq!(stream.count(|c| matches!(c, Call::Unsubscribe(_))), 0);

        assert_eq!(mux.unsubscribe(&btc, 2), Removal::ChannelEmptied);
        assert_eq!(
            stream.calls()[1..],
            [Call::Unsubscribe("btcusdt@kline_1m".into()), Call::Close]
        );
        assert!(!mux.stats().upstream_open);
    }

    #[test]
    fn unsubscribe_unknown_sink_is_noop() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();
        assert_eq!(mux.unsubscribe(&key("BTCUSDT"), 99), Removal::NotRegistered);
        assert_eq!(mux.unsubscribe(&key("ETHUSDT"), 1), Removal::NotRegistered);
        assert_eq!(stream.calls().len(), 1);
    }

    #[test]
    fn reopen_after_close() {
        let (stream, mux) = setup();
        let (sink, _rx) = Sink::new(1, 8);
        let btc = key("BTCUSDT");

        mux.subscribe(&btc, &sink).unwrap();
        mux.unsubscribe(&btc, 1);
        mux.subscribe(&btc, &sink).unwrap();

        assert_eq!(
            stream.calls(),
            vec![
                Call::Open("btcusdt@kline_1m".into()),
                Call::Unsubscribe("btcusdt@kline_1m".into()),
                Call::Close,
                Call::Open("btcusdt@kline_1m".into()),
            ]
        );
    }

    #[test]
    fn upstream_failure_leaves_table_unchanged() {
        let mut stream = MockMarketStream::new();
        stream
            .expect_open()
            .times(1)
            .returning(|_| Err(FeedError::Stopped));
        let mux = Multiplexer::new(Arc::new(stream));
        let (sink, _rx) = Sink::new(1, 8);

        let err = mux.subscribe(&key("BTCUSDT"), &sink).unwrap_err();

        assert!(matches!(
            err,
            MultiplexerError::Upstream {
                op: UpstreamOp::Open,
                ..
            }
        ));
        assert_eq!(mux.stats(), MultiplexerStats::default());
    }

    #[test]
    fn failed_subscribe_does_not_mark_upstream_open() {
        let mut stream = MockMarketStream::new();
        let mut seq = mockall::Sequence::new();
        stream
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FeedError::Rejected("busy".into())));
        stream
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mux = Multiplexer::new(Arc::new(stream));
        let (sink, _rx) = Sink::new(1, 8);

        assert!(mux.subscribe(&key("BTCUSDT"), &sink).is_err());
        assert!(mux.subscribe(&key("BTCUSDT"), &sink).is_ok());
        assert!(mux.stats().upstream_open);
    }

    #[test]
    fn closed_kline_reaches_every_sink() {
        let (_stream, mux) = setup();
        let (a, mut ra) = Sink::new(1, 8);
        let (b, mut rb) = Sink::new(2, 8);
        let (c, mut rc) = Sink::new(3, 8);

        for sink in [&a, &b, &c] {
            mux.subscribe(&key("BTCUSDT"), sink).unwrap();
        }

        let outcome = mux.dispatch("btcusdt@kline_1m", &CLOSED, "payload");

        assert_eq!(
            outcome,
            Dispatch::Delivered {
                delivered: 3,
                dropped: 0
            }
        );
        assert_eq!(ra.try_recv().unwrap(), "payload");
        assert_eq!(rb.try_recv().unwrap(), "payload");
        assert_eq!(rc.try_recv().unwrap(), "payload");
    }

    #[test]
    fn forming_kline_is_not_forwarded() {
        let (_stream, mux) = setup();
        let (a, mut ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();

        assert_eq!(
            mux.dispatch("btcusdt@kline_1m", &FORMING, "payload"),
            Dispatch::Filtered
        );
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn other_event_kinds_are_not_forwarded() {
        let (_stream, mux) = setup();
        let (a, mut ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();

        let event = StreamEvent::Other("aggTrade".into());
        assert_eq!(
            mux.dispatch("btcusdt@kline_1m", &event, "payload"),
            Dispatch::Filtered
        );
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn unknown_stream_is_dropped() {
        let (_stream, mux) = setup();
        let (a, mut ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();

        assert_eq!(
            mux.dispatch("ethusdt@kline_1m", &CLOSED, "payload"),
            Dispatch::UnknownStream
        );
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn full_sink_does_not_block_others() {
        let (_stream, mux) = setup();
        let (slow, _slow_rx) = Sink::new(1, 1);
        let (fast, mut fast_rx) = Sink::new(2, 8);

        mux.subscribe(&key("BTCUSDT"), &slow).unwrap();
        mux.subscribe(&key("BTCUSDT"), &fast).unwrap();

        mux.dispatch("btcusdt@kline_1m", &CLOSED, "one");
        let outcome = mux.dispatch("btcusdt@kline_1m", &CLOSED, "two");

        assert_eq!(
            outcome,
            Dispatch::Delivered {
                delivered: 1,
                dropped: 1
            }
        );
        assert_eq!(fast_rx.try_recv().unwrap(), "one");
        assert_eq!(fast_rx.try_recv().unwrap(), "two");
    }

    #[test]
    fn dropped_session_sink_is_skipped() {
        let (_stream, mux) = setup();
        let (gone, gone_rx) = Sink::new(1, 8);
        let (live, mut live_rx) = Sink::new(2, 8);

        mux.subscribe(&key("BTCUSDT"), &gone).unwrap();
        mux.subscribe(&key("BTCUSDT"), &live).unwrap();
        drop(gone);
        drop(gone_rx);

        let outcome = mux.dispatch("btcusdt@kline_1m", &CLOSED, "payload");

        assert_eq!(
            outcome,
            Dispatch::Delivered {
                delivered: 1,
                dropped: 0
            }
        );
        assert_eq!(live_rx.try_recv().unwrap(), "payload");
    }

    #[test]
    fn remove_session_releases_only_its_channels() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);
        let (b, _rb) = Sink::new(2, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();
        mux.subscribe(&key("ETHUSDT"), &a).unwrap();
        mux.subscribe(&key("ETHUSDT"), &b).unwrap();

        let released = mux.remove_session(1);

        assert_eq!(released, vec![key("BTCUSDT")]);
        assert_eq!(mux.active_channels(), vec![key("ETHUSDT")]);
        assert_eq!(stream.count(|c| *c == Call::Close), 0);
        assert!(mux.channels_of(1).is_empty());
        assert_eq!(mux.channels_of(2), vec![key("ETHUSDT")]);
    }

    #[test]
    fn remove_session_is_idempotent() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();
        mux.subscribe(&key("ETHUSDT"), &a).unwrap();

        assert_eq!(mux.remove_session(1).len(), 2);
        let calls_after_first = stream.calls();
        assert!(mux.remove_session(1).is_empty());

        assert_eq!(stream.calls(), calls_after_first);
        assert_eq!(stream.count(|c| matches!(c, Call::Unsubscribe(_))), 2);
        assert_eq!(stream.count(|c| *c == Call::Close), 1);
        assert_eq!(calls_after_first.last(), Some(&Call::Close));
    }

    #[test]
    fn shutdown_closes_upstream_and_refuses_new_sinks() {
        let (stream, mux) = setup();
        let (a, _ra) = Sink::new(1, 8);

        mux.subscribe(&key("BTCUSDT"), &a).unwrap();

        assert_eq!(mux.shutdown(), vec![key("BTCUSDT")]);
        assert_eq!(stream.calls().last(), Some(&Call::Close));
        assert!(matches!(
            mux.subscribe(&key("ETHUSDT"), &a),
            Err(MultiplexerError::ShutDown)
        ));

        // Late cleanup from draining sessions must not touch the upstream
        mux.remove_session(1);
        assert!(mux.shutdown().is_empty());
        assert_eq!(stream.count(|c| *c == Call::Close), 1);
    }

    #[test]
    fn concurrent_subscribes_to_new_channel_call_upstream_once() {
        let (stream, mux) = setup();
        let mux = Arc::new(mux);

        let handles: Vec<_> = (0..8)
            .map(|id| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    let (sink, rx) = Sink::new(id, 8);
                    mux.subscribe(&key("BTCUSDT"), &sink).unwrap();
                    (sink, rx)
                })
            })
            .collect();

        let sinks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(stream.calls(), vec![Call::Open("btcusdt@kline_1m".into())]);
        assert_eq!(mux.stats().registrations, sinks.len());
    }
}
