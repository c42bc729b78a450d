//! Stream Events
//!
//! The multiplexer only needs to know two things about an inbound
//! payload: which channel it belongs to and, for klines, whether the
//! candle has closed. Everything else stays opaque and is forwarded as
//! the raw string the exchange sent.

/// Decoded shape of one combined-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A kline update; `closed` is the exchange's final-bar flag.
    Kline {
        /// True once the candle interval has ended.
        closed: bool,
    },
    /// Any other event kind, tagged with its `e` field.
    Other(String),
}

impl StreamEvent {
    /// Whether this event should be fanned out to subscribers.
    ///
    /// Only closed klines are forwarded; partial candles never leave
    /// the service.
    #[must_use]
    pub const fn is_forwardable(&self) -> bool {
        matches!(self, Self::Kline { closed: true })
    }

    /// Event kind label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Kline { .. } => "kline",
            Self::Other(kind) => kind,
        }
    }
}
