//! Port Interfaces
//!
//! Contracts between the multiplexing core and the exchange adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`MarketStream`]: the upstream websocket. Calls only enqueue work for
//!   the connection task and never wait on the network, so the multiplexer
//!   can make them while holding its lock.
//! - [`ExchangeApi`]: request/response queries (server time, exchange
//!   info, historical klines).
//!
//! Inbound stream payloads do not go through a port method; the stream
//! adapter pushes [`FeedEvent`]s into an mpsc channel that the dispatcher
//! drains.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::channel::ChannelKey;
use crate::domain::exchange::ExchangeSnapshot;
use crate::domain::klines::RawBar;

// =============================================================================
// Market Stream
// =============================================================================

/// Errors from the upstream stream port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The connection task has shut down.
    #[error("market stream stopped")]
    Stopped,

    /// The adapter refused the command.
    #[error("market stream rejected command: {0}")]
    Rejected(String),
}

/// Upstream subscription control.
#[cfg_attr(test, mockall::automock)]
pub trait MarketStream: Send + Sync {
    /// Connect with `channel` as the first subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    fn open(&self, channel: &ChannelKey) -> Result<(), FeedError>;

    /// Add a channel to the open connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    fn subscribe(&self, channel: &ChannelKey) -> Result<(), FeedError>;

    /// Remove a channel from the open connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), FeedError>;

    /// Disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    fn close(&self) -> Result<(), FeedError>;
}

/// Events emitted by the stream adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Connection established.
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// Reconnecting after a failure.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Raw text frame from the combined stream.
    Message(String),
    /// Adapter-level error.
    Error(String),
}

// =============================================================================
// Exchange API
// =============================================================================

/// Errors from exchange queries.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure.
    #[error("request failed: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("exchange returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Response body did not match the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The exchange reported no usable server time.
    #[error("server time unavailable")]
    NoServerTime,
}

/// Exchange queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Exchange clock in epoch milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the time is missing.
    async fn server_time(&self) -> Result<i64, ApiError>;

    /// Full exchange-info snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the payload is malformed.
    async fn exchange_info(&self) -> Result<ExchangeSnapshot, ApiError>;

    /// Up to `limit` most recent klines, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the payload is malformed.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32)
    -> Result<Vec<RawBar>, ApiError>;
}
