//! Synchronization Schedule
//!
//! The exchange-info snapshot is reloaded once per UTC day. The loop that
//! drives it ticks on a fixed interval and cannot land exactly on
//! midnight, so a tick refreshes when the corrected server time falls
//! inside the first interval of the day. With one tick per interval that
//! window is hit exactly once a day.

use std::time::Duration;

use chrono::Utc;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Whether the snapshot should be reloaded at this tick.
///
/// `corrected_now_ms` is server time in epoch milliseconds. Returns
/// `true` when it lies in `[00:00, 00:00 + tick)` UTC.
#[must_use]
pub fn should_refresh_snapshot(corrected_now_ms: i64, tick: Duration) -> bool {
    let tick_ms = i64::try_from(tick.as_millis()).unwrap_or(i64::MAX);
    corrected_now_ms.rem_euclid(MILLIS_PER_DAY) < tick_ms
}

/// Local wall clock corrected by the exchange clock offset.
#[must_use]
pub fn corrected_now_ms(offset_ms: i64) -> i64 {
    Utc::now().timestamp_millis().saturating_add(offset_ms)
}
