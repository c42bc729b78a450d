//! Synchronization Loop
//!
//! Keeps the metadata cache fresh. Every tick re-measures the clock offset;
//! the tick that lands in the first interval of a UTC day also reloads the
//! exchange-info snapshot. A failed query is logged and retried on the next
//! tick, and a snapshot that failed to load stays due until one succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::metadata::MetadataCache;
use crate::application::ports::{ApiError, ExchangeApi};
use crate::domain::sync::should_refresh_snapshot;

/// Default tick: every 30 minutes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Outcome of one synchronization tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Clock offset updated.
    Offset,
    /// Clock offset updated and snapshot replaced.
    Snapshot,
    /// A query failed.
    Failed,
}

impl SyncOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offset => "offset",
            Self::Snapshot => "snapshot",
            Self::Failed => "failed",
        }
    }
}

fn record_tick(outcome: SyncOutcome) {
    counter!("data_service_sync_ticks_total", "outcome" => outcome.as_str()).increment(1);
}

/// Periodic offset and snapshot refresher.
pub struct SyncLoop {
    api: Arc<dyn ExchangeApi>,
    cache: Arc<MetadataCache>,
    interval: Duration,
    cancel: CancellationToken,
    snapshot_due: AtomicBool,
}

impl SyncLoop {
    /// Create a loop ticking every `interval` until `cancel` fires.
    #[must_use]
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        cache: Arc<MetadataCache>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            cache,
            interval,
            cancel,
            snapshot_due: AtomicBool::new(false),
        }
    }

    /// Initial synchronization: measure the offset and load a snapshot
    /// regardless of the time of day.
    ///
    /// On failure the snapshot stays due and the next tick loads it.
    ///
    /// # Errors
    ///
    /// Returns the first query error.
    pub async fn prime(&self) -> Result<(), ApiError> {
        self.snapshot_due.store(true, Ordering::Release);
        self.refresh_offset().await?;
        self.refresh_snapshot().await
    }

    /// Whether the next tick reloads the snapshot regardless of the hour.
    #[must_use]
    pub fn snapshot_due(&self) -> bool {
        self.snapshot_due.load(Ordering::Acquire)
    }

    /// Run until cancelled. The first tick fires one interval from now.
    pub async fn run(self) {
        let start = Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "Sync loop started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // An in-flight refresh is abandoned on cancel; the snapshot is
            // only published after it is fully built.
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.tick() => {
                    if let Err(e) = result {
                        record_tick(SyncOutcome::Failed);
                        tracing::warn!(
                            error = %e,
                            snapshot_due = self.snapshot_due(),
                            "Sync tick failed, retrying next tick"
                        );
                    }
                }
            }
        }

        tracing::info!("Sync loop stopped");
    }

    /// One tick: update the offset, and the snapshot at the day boundary
    /// or while an earlier snapshot load is still outstanding.
    ///
    /// # Errors
    ///
    /// Returns the first query error.
    pub async fn tick(&self) -> Result<SyncOutcome, ApiError> {
        let server_time = match self.refresh_offset().await {
            Ok(server_time) => server_time,
            Err(e) => {
                // The day boundary is judged on the last known offset so a
                // failed time query at midnight still leaves the reload due.
                if should_refresh_snapshot(self.cache.corrected_now_ms(), self.interval) {
                    self.snapshot_due.store(true, Ordering::Release);
                }
                return Err(e);
            }
        };

        if should_refresh_snapshot(server_time, self.interval) {
            self.snapshot_due.store(true, Ordering::Release);
        }

        let outcome = if self.snapshot_due() {
            self.refresh_snapshot().await?;
            SyncOutcome::Snapshot
        } else {
            SyncOutcome::Offset
        };

        record_tick(outcome);
        Ok(outcome)
    }

    /// Returns the server time the offset was derived from.
    #[allow(clippy::cast_precision_loss)]
    async fn refresh_offset(&self) -> Result<i64, ApiError> {
        let server_time = self.api.server_time().await?;
        let offset = server_time - Utc::now().timestamp_millis();

        self.cache.set_clock_offset_ms(offset);
        gauge!("data_service_clock_offset_ms").set(offset as f64);
        tracing::debug!(server_time, offset_ms = offset, "Clock offset updated");

        Ok(server_time)
    }

    /// Clears the due flag only once the new snapshot is published.
    async fn refresh_snapshot(&self) -> Result<(), ApiError> {
        let snapshot = self.api.exchange_info().await?.with_fetched_at(Utc::now());
        let symbols = snapshot.symbols.len();

        self.cache.replace_snapshot(snapshot);
        self.snapshot_due.store(false, Ordering::Release);
        tracing::info!(symbols, "Exchange info refreshed");
        Ok(())
    }
}
