//! Subscription Table
//!
//! Tracks which sinks want which channels. A channel is present in the
//! table exactly when at least one sink wants it, which is also exactly
//! when the upstream feed should have it subscribed. Mutations report the
//! transition they caused (first sink in, last sink out) so the caller can
//! mirror it upstream.
//!
//! # Design
//!
//! The table keeps two indexes:
//! - channel → set of sink ids, for fan-out
//! - sink → set of channels, for disconnect cleanup
//!
//! Sinks are sets keyed by id, so removal never depends on position and a
//! sink can appear under a channel at most once. The table itself is not
//! synchronized; the multiplexer owns it behind a single lock.

use std::collections::{HashMap, HashSet};

use crate::domain::channel::ChannelKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a session sink.
pub type SinkId = u64;

/// Outcome of adding a sink to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The channel was new; the upstream must subscribe it.
    FirstSink,
    /// The channel already had other sinks.
    Joined,
    /// The sink was already registered; nothing changed.
    AlreadyRegistered,
}

/// Outcome of removing a sink from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The sink was not registered; nothing changed.
    NotRegistered,
    /// Other sinks remain on the channel.
    Remaining(usize),
    /// The last sink left; the upstream must unsubscribe the channel.
    ChannelEmptied,
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Channel ↔ sink registrations.
///
/// # Example
///
/// ```rust
/// use binance_data_service::domain::channel::ChannelKey;
/// use binance_data_service::domain::subscription::{Insertion, Removal, SubscriptionTable};
///
/// let mut table = SubscriptionTable::new();
/// let btc = ChannelKey::kline("BTCUSDT", "1m").unwrap();
///
/// // First sink on a channel needs an upstream subscription
/// assert_eq!(table.insert(&btc, 1), Insertion::FirstSink);
///
/// // Second sink shares it
/// assert_eq!(table.insert(&btc, 2), Insertion::Joined);
///
/// // Sink 1 leaves; sink 2 keeps the channel alive
/// assert_eq!(table.remove(&btc, 1), Removal::Remaining(1));
///
/// // Sink 2 leaves; the upstream subscription can go
/// assert_eq!(table.remove(&btc, 2), Removal::ChannelEmptied);
/// assert!(table.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    /// Map from channel to the sinks that want it.
    channel_sinks: HashMap<ChannelKey, HashSet<SinkId>>,
    /// Map from sink to the channels it joined.
    sink_channels: HashMap<SinkId, HashSet<ChannelKey>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` under `channel`.
    pub fn insert(&mut self, channel: &ChannelKey, sink: SinkId) -> Insertion {
        let sinks = self.channel_sinks.entry(channel.clone()).or_default();
        let first = sinks.is_empty();

        if !sinks.insert(sink) {
            return Insertion::AlreadyRegistered;
        }

        self.sink_channels
            .entry(sink)
            .or_default()
            .insert(channel.clone());

        if first {
            Insertion::FirstSink
        } else {
            Insertion::Joined
        }
    }

    /// Deregister `sink` from `channel`.
    pub fn remove(&mut self, channel: &ChannelKey, sink: SinkId) -> Removal {
        let Some(sinks) = self.channel_sinks.get_mut(channel) else {
            return Removal::NotRegistered;
        };

        if !sinks.remove(&sink) {
            return Removal::NotRegistered;
        }

        let remaining = sinks.len();
        if remaining == 0 {
            self.channel_sinks.remove(channel);
        }

        // Clean up the reverse index
        if let Some(channels) = self.sink_channels.get_mut(&sink) {
            channels.remove(channel);
            if channels.is_empty() {
                self.sink_channels.remove(&sink);
            }
        }

        if remaining == 0 {
            Removal::ChannelEmptied
        } else {
            Removal::Remaining(remaining)
        }
    }

    /// Deregister `sink` from every channel.
    ///
    /// Returns the channels that lost their last sink, sorted. Calling it
    /// again for the same sink returns nothing.
    pub fn remove_sink(&mut self, sink: SinkId) -> Vec<ChannelKey> {
        let Some(channels) = self.sink_channels.remove(&sink) else {
            return vec![];
        };

        let mut emptied = Vec::new();

        for channel in channels {
            if let Some(sinks) = self.channel_sinks.get_mut(&channel) {
                sinks.remove(&sink);
                if sinks.is_empty() {
                    self.channel_sinks.remove(&channel);
                    emptied.push(channel);
                }
            }
        }

        emptied.sort();
        emptied
    }

    /// Drop every registration, returning the channels that were live.
    pub fn clear(&mut self) -> Vec<ChannelKey> {
        self.sink_channels.clear();
        let mut channels: Vec<_> = self.channel_sinks.drain().map(|(k, _)| k).collect();
        channels.sort();
        channels
    }

    /// Sinks registered under a channel, looked up by stream name.
    #[must_use]
    pub fn sinks(&self, channel: &str) -> Option<&HashSet<SinkId>> {
        self.channel_sinks.get(channel)
    }

    /// Whether `sink` is registered under `channel`.
    #[must_use]
    pub fn is_registered(&self, channel: &ChannelKey, sink: SinkId) -> bool {
        self.channel_sinks
            .get(channel)
            .is_some_and(|sinks| sinks.contains(&sink))
    }

    /// Whether `sink` has any registration left.
    #[must_use]
    pub fn has_sink(&self, sink: SinkId) -> bool {
        self.sink_channels.contains_key(&sink)
    }

    /// Channels for a specific sink, sorted.
    #[must_use]
    pub fn channels_of(&self, sink: SinkId) -> Vec<ChannelKey> {
        let mut channels: Vec<_> = self
            .sink_channels
            .get(&sink)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// All live channels, sorted.
    #[must_use]
    pub fn active_channels(&self) -> Vec<ChannelKey> {
        let mut channels: Vec<_> = self.channel_sinks.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Whether no channel is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channel_sinks.is_empty()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            channel_count: self.channel_sinks.len(),
            sink_count: self.sink_channels.len(),
            registration_count: self.channel_sinks.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of live channels.
    pub channel_count: usize,
    /// Number of sinks with at least one channel.
    pub sink_count: usize,
    /// Total (channel, sink) pairs.
    pub registration_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str) -> ChannelKey {
        ChannelKey::kline(symbol, "1m").unwrap()
    }

    #[test]
    fn first_insert_reports_new_channel() {
        let mut table = SubscriptionTable::new();

        assert_eq!(table.insert(&key("BTCUSDT"), 1), Insertion::FirstSink);
        assert_eq!(table.insert(&key("ETHUSDT"), 1), Insertion::FirstSink);
        assert_eq!(table.active_channels().len(), 2);
    }

    #[test]
    fn second_sink_joins_existing_channel() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);
        assert_eq!(table.insert(&key("BTCUSDT"), 2), Insertion::Joined);

        let sinks = table.sinks("btcusdt@kline_1m").unwrap();
        assert_eq!(sinks.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);
        assert_eq!(
            table.insert(&key("BTCUSDT"), 1),
            Insertion::AlreadyRegistered
        );
        assert_eq!(table.stats().registration_count, 1);
    }

    #[test]
    fn remove_keeps_remaining_sinks() {
        let mut table = SubscriptionTable::new();
        let btc = key("BTCUSDT");

        table.insert(&btc, 1);
        table.insert(&btc, 2);
        table.insert(&btc, 3);

        assert_eq!(table.remove(&btc, 2), Removal::Remaining(2));

        let sinks = table.sinks(btc.as_str()).unwrap();
        assert!(sinks.contains(&1));
        assert!(sinks.contains(&3));
        assert!(!sinks.contains(&2));
    }

    #[test]
    fn last_remove_empties_channel() {
        let mut table = SubscriptionTable::new();
        let btc = key("BTCUSDT");

        table.insert(&btc, 1);
        assert_eq!(table.remove(&btc, 1), Removal::ChannelEmptied);
        assert!(table.sinks(btc.as_str()).is_none());
        assert!(!table.has_sink(1));
        assert!(table.is_empty());
    }

    #[test]
    fn remove_unregistered_is_noop() {
        let mut table = SubscriptionTable::new();
        let btc = key("BTCUSDT");

        assert_eq!(table.remove(&btc, 1), Removal::NotRegistered);

        table.insert(&btc, 1);
        assert_eq!(table.remove(&btc, 2), Removal::NotRegistered);
        assert_eq!(table.stats().registration_count, 1);
    }

    #[test]
    fn remove_sink_reports_only_emptied_channels() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);
        table.insert(&key("ETHUSDT"), 1);
        table.insert(&key("ETHUSDT"), 2);
        table.insert(&key("SOLUSDT"), 1);

        let emptied = table.remove_sink(1);

        assert_eq!(emptied, vec![key("BTCUSDT"), key("SOLUSDT")]);
        assert_eq!(table.active_channels(), vec![key("ETHUSDT")]);
        assert_eq!(table.sinks("ethusdt@kline_1m").unwrap().len(), 1);
    }

    #[test]
    fn remove_sink_is_idempotent() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);

        assert_eq!(table.remove_sink(1).len(), 1);
        assert!(table.remove_sink(1).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn channels_of_sink() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("ETHUSDT"), 7);
        table.insert(&key("BTCUSDT"), 7);

        assert_eq!(table.channels_of(7), vec![key("BTCUSDT"), key("ETHUSDT")]);
        assert!(table.channels_of(8).is_empty());
        assert!(table.is_registered(&key("BTCUSDT"), 7));
        assert!(!table.is_registered(&key("BTCUSDT"), 8));
    }

    #[test]
    fn clear_returns_live_channels() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);
        table.insert(&key("ETHUSDT"), 2);

        assert_eq!(table.clear(), vec![key("BTCUSDT"), key("ETHUSDT")]);
        assert!(table.is_empty());
        assert_eq!(table.stats(), SubscriptionStats::default());
    }

    #[test]
    fn stats_track_both_indexes() {
        let mut table = SubscriptionTable::new();

        table.insert(&key("BTCUSDT"), 1);
        table.insert(&key("BTCUSDT"), 2);
        table.insert(&key("ETHUSDT"), 2);

        let stats = table.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.sink_count, 2);
        assert_eq!(stats.registration_count, 3);
    }
}
