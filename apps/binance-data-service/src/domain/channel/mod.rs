//! Channel Keys
//!
//! A channel is one upstream kline stream, identified by symbol and
//! interval. Binance names combined streams in lowercase
//! (`btcusdt@kline_1m`), so keys are normalized on construction and
//! compare equal regardless of how the client spelled the symbol.

use std::borrow::Borrow;
use std::fmt;

use thiserror::Error;

/// Errors building a channel key from client input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelKeyError {
    /// Symbol was empty or whitespace.
    #[error("symbol must not be empty")]
    EmptySymbol,

    /// Interval was empty or whitespace.
    #[error("interval must not be empty")]
    EmptyInterval,
}

/// Normalized `<symbol>@kline_<interval>` stream name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Build the kline channel for a symbol and interval.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is empty after trimming.
    pub fn kline(symbol: &str, interval: &str) -> Result<Self, ChannelKeyError> {
        let symbol = symbol.trim();
        let interval = interval.trim();
        if symbol.is_empty() {
            return Err(ChannelKeyError::EmptySymbol);
        }
        if interval.is_empty() {
            return Err(ChannelKeyError::EmptyInterval);
        }
        Ok(Self(format!("{symbol}@kline_{interval}").to_lowercase()))
    }

    /// The stream name as sent upstream.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Lets the subscription table be probed with the raw stream name of an
// inbound event without allocating a key.
impl Borrow<str> for ChannelKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ChannelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;

    #[test_case("BTCUSDT", "1m", "btcusdt@kline_1m" ; "uppercase symbol")]
    #[test_case("ethusdt", "15m", "ethusdt@kline_15m" ; "already lowercase")]
    #[test_case(" SolUsdt ", "1h", "solusdt@kline_1h" ; "trimmed and mixed case")]
    fn kline_key_is_normalized(symbol: &str, interval: &str, expected: &str) {
        let key = ChannelKey::kline(symbol, interval).unwrap();
        assert_eq!(key.as_str(), expected);
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(
            ChannelKey::kline("", "1m"),
            Err(ChannelKeyError::EmptySymbol)
        );
        assert_eq!(
            ChannelKey::kline("BTCUSDT", "  "),
            Err(ChannelKeyError::EmptyInterval)
        );
    }

    #[test]
    fn spelling_variants_are_the_same_channel() {
        let a = ChannelKey::kline("BTCUSDT", "1m").unwrap();
        let b = ChannelKey::kline("btcUSDT", "1m").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn set_lookup_by_stream_name() {
        let mut set = HashSet::new();
        set.insert(ChannelKey::kline("BTCUSDT", "1m").unwrap());
        assert!(set.contains("btcusdt@kline_1m"));
        assert!(!set.contains("btcusdt@kline_5m"));
    }
}
