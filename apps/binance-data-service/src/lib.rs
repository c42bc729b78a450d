#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Binance Data Service - Kline Stream Multiplexer
//!
//! A gRPC service that keeps a single connection to the Binance USD-M
//! futures combined stream and fans closed klines out to any number of
//! downstream clients, alongside request/response market data lookups.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and rules with no I/O
//!   - `channel`: kline channel naming
//!   - `subscription`: the channel → sink table
//!   - `event`, `klines`, `exchange`, `session`, `sync`
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: exchange stream and REST interfaces
//!   - `services`: multiplexer, sessions, sync loop, handlers
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: REST client and combined-stream websocket client
//!   - `grpc`: `DataService` server implementation
//!   - `config`: configuration from the environment
//!   - `health`: health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      ┌─────────────┐     ┌─────────────┐
//! Binance stream WS ──►│ Multiplexer │────►│  Sessions   │──► Client 1
//!        ▲             │ (one entry  │     │ (gRPC bidi) │──► Client 2
//!        │             │ per channel)│     └─────────────┘──► Client N
//!        └─ subscribe ─┴─────────────┘
//! Binance REST ──► Sync loop ──► Metadata cache ──► Unary handlers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::channel::{ChannelKey, ChannelKeyError};
pub use domain::event::StreamEvent;
pub use domain::session::{SessionId, SessionState};

// Ports
pub use application::ports::{ApiError, ExchangeApi, FeedError, FeedEvent, MarketStream};

// Services
pub use application::services::{
    ChannelRequest, HandlerError, MarketDataService, MetadataCache, Multiplexer,
    MultiplexerError, MultiplexerStats, Sink, SessionError, SessionRegistry, SyncLoop,
};

// Infrastructure config
pub use infrastructure::config::{
    BinanceSettings, ConfigError, ServerSettings, ServiceConfig, WebSocketSettings,
};

// Binance adapters
pub use infrastructure::binance::{
    BinanceRest, FeedDispatcher, FeedState, FeedStatus, StreamClient, StreamHandle, stream_client,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// gRPC server (for integration tests)
pub use infrastructure::grpc::{
    DataServer, DataServerConfig, proto::binance::v1 as proto,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
