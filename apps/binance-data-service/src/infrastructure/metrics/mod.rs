//! Prometheus Metrics Module
//!
//! Exposes service metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Events**: stream events received, forwarded and dropped
//! - **Upstream**: subscription commands sent to the exchange stream
//! - **Sessions**: open downstream sessions and live channels
//! - **Sync**: synchronization ticks and the measured clock offset
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Application
//! services record through the `metrics` macros under the names described
//! here; everything is a no-op until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::DropReason;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Event counters
    describe_counter!(
        "data_service_events_received_total",
        "Total stream events received from the exchange"
    );
    describe_counter!(
        "data_service_events_forwarded_total",
        "Total event deliveries to session sinks"
    );
    describe_counter!(
        "data_service_events_dropped_total",
        "Total events dropped, by reason"
    );

    // Upstream commands
    describe_counter!(
        "data_service_upstream_calls_total",
        "Total subscription commands sent upstream, by operation"
    );
    describe_counter!(
        "data_service_reconnects_total",
        "Total exchange stream reconnection attempts"
    );

    // Session gauges
    describe_gauge!(
        "data_service_sessions",
        "Number of open GetSocketData sessions"
    );
    describe_gauge!(
        "data_service_channels",
        "Number of channels subscribed upstream"
    );

    // Synchronization
    describe_counter!(
        "data_service_sync_ticks_total",
        "Total synchronization ticks, by outcome"
    );
    describe_gauge!(
        "data_service_clock_offset_ms",
        "Exchange clock minus local clock in milliseconds"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an event received from the exchange stream.
pub fn record_event_received() {
    counter!("data_service_events_received_total").increment(1);
}

/// Record dropped events.
pub fn record_events_dropped(reason: DropReason, count: u64) {
    counter!(
        "data_service_events_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record a stream reconnection attempt.
pub fn record_reconnect() {
    counter!("data_service_reconnects_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_event_received();
        record_events_dropped(DropReason::Malformed, 3);
        record_reconnect();
    }
}
