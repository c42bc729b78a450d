//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status: feed, sessions, channels, metadata
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (exchange snapshot loaded)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{MetadataCache, Multiplexer, SessionRegistry};
use crate::infrastructure::binance::{FeedState, FeedStatus};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream stream status.
    pub feed: FeedInfo,
    /// Open sessions.
    pub sessions: usize,
    /// Channel table status.
    pub channels: ChannelInfo,
    /// Clock offset and snapshot status.
    pub metadata: MetadataInfo,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Serving, but the stream or clock is not in shape.
    Degraded,
    /// No exchange snapshot yet.
    Unhealthy,
}

/// Upstream stream status.
#[derive(Debug, Clone, Serialize)]
pub struct FeedInfo {
    /// Connection state.
    pub state: &'static str,
    /// Whether the stream is connected.
    pub connected: bool,
    /// Text frames received.
    pub messages_received: u64,
    /// Reconnection attempts.
    pub reconnects: u64,
    /// Time of the last frame.
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Channel table status.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    /// Channels subscribed upstream.
    pub active: usize,
    /// (channel, session) registrations.
    pub registrations: usize,
    /// Whether the upstream is open.
    pub upstream_open: bool,
}

/// Metadata cache status.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataInfo {
    /// Whether a clock offset has been measured.
    pub clock_synced: bool,
    /// Exchange minus local clock.
    pub clock_offset_ms: i64,
    /// Symbols in the snapshot.
    pub symbols: usize,
    /// Snapshot age in seconds.
    pub snapshot_age_secs: Option<i64>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<FeedStatus>,
    multiplexer: Arc<Multiplexer>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<MetadataCache>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        feed: Arc<FeedStatus>,
        multiplexer: Arc<Multiplexer>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<MetadataCache>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            multiplexer,
            sessions,
            cache,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind `0.0.0.0:port` and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        tracing::info!(addr = ?listener.local_addr().ok(), "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.cache.snapshot().is_loaded() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feed_state = state.feed.state();
    let feed = FeedInfo {
        state: feed_state.as_str(),
        connected: feed_state == FeedState::Connected,
        messages_received: state.feed.messages(),
        reconnects: state.feed.reconnects(),
        last_message_at: state
            .feed
            .last_message_ms()
            .and_then(DateTime::from_timestamp_millis),
    };

    let stats = state.multiplexer.stats();
    let channels = ChannelInfo {
        active: stats.channels,
        registrations: stats.registrations,
        upstream_open: stats.upstream_open,
    };

    let snapshot = state.cache.snapshot();
    let now = Utc::now();
    let metadata = MetadataInfo {
        clock_synced: state.cache.has_clock_offset(),
        clock_offset_ms: state.cache.clock_offset_ms(),
        symbols: snapshot.symbols.len(),
        snapshot_age_secs: snapshot.fetched_at.map(|at| (now - at).num_seconds()),
    };

    HealthResponse {
        status: determine_health_status(snapshot.is_loaded(), &feed, &channels, &metadata),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: now,
        feed,
        sessions: state.sessions.active_sessions(),
        channels,
        metadata,
    }
}

fn determine_health_status(
    snapshot_loaded: bool,
    feed: &FeedInfo,
    channels: &ChannelInfo,
    metadata: &MetadataInfo,
) -> HealthStatus {
    if !snapshot_loaded {
        return HealthStatus::Unhealthy;
    }

    let stream_down = channels.upstream_open && !feed.connected;
    if stream_down || !metadata.clock_synced {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
