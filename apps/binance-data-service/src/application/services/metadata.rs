//! Metadata Cache
//!
//! Latest clock offset and exchange snapshot. Both are written only by the
//! synchronization loop and read by request handlers without locking: the
//! offset is an atomic, the snapshot an [`ArcSwap`] so readers always hold
//! either the previous or the next complete snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use crate::domain::exchange::ExchangeSnapshot;
use crate::domain::sync::corrected_now_ms;

/// Shared clock offset and exchange snapshot.
#[derive(Debug, Default)]
pub struct MetadataCache {
    offset_ms: AtomicI64,
    offset_known: AtomicBool,
    snapshot: ArcSwap<ExchangeSnapshot>,
}

impl MetadataCache {
    /// Create a cache with a zero offset and an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange clock minus local clock, in milliseconds.
    #[must_use]
    pub fn clock_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Whether an offset has been measured yet.
    #[must_use]
    pub fn has_clock_offset(&self) -> bool {
        self.offset_known.load(Ordering::Acquire)
    }

    /// Store a freshly measured offset.
    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Release);
        self.offset_known.store(true, Ordering::Release);
    }

    /// Local time corrected to exchange time, in epoch milliseconds.
    #[must_use]
    pub fn corrected_now_ms(&self) -> i64 {
        corrected_now_ms(self.clock_offset_ms())
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ExchangeSnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot wholesale.
    pub fn replace_snapshot(&self, snapshot: ExchangeSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// When the current snapshot was fetched.
    #[must_use]
    pub fn snapshot_fetched_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.load().fetched_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::SymbolInfo;

    fn snapshot_with(count: usize) -> ExchangeSnapshot {
        ExchangeSnapshot {
            symbols: (0..count)
                .map(|i| SymbolInfo {
                    symbol: format!("SYM{i}USDT"),
                    ..SymbolInfo::default()
                })
                .collect(),
            fetched_at: Some(Utc::now()),
        }
    }

    #[test]
    fn starts_empty() {
        let cache = MetadataCache::new();
        assert_eq!(cache.clock_offset_ms(), 0);
        assert!(!cache.has_clock_offset());
        assert!(!cache.snapshot().is_loaded());
        assert!(cache.snapshot_fetched_at().is_none());
    }

    #[test]
    fn offset_round_trip() {
        let cache = MetadataCache::new();
        cache.set_clock_offset_ms(-1_250);
        assert_eq!(cache.clock_offset_ms(), -1_250);
        assert!(cache.has_clock_offset());
    }

    #[test]
    fn corrected_time_applies_offset() {
        let cache = MetadataCache::new();
        cache.set_clock_offset_ms(3_600_000);

        let local = Utc::now().timestamp_millis();
        let corrected = cache.corrected_now_ms();

        assert!(corrected - local >= 3_600_000);
        assert!(corrected - local < 3_600_000 + 1_000);
    }

    #[test]
    fn readers_keep_their_snapshot_across_replace() {
        let cache = MetadataCache::new();
        cache.replace_snapshot(snapshot_with(2));

        let held = cache.snapshot();
        cache.replace_snapshot(snapshot_with(5));

        assert_eq!(held.symbols.len(), 2);
        assert_eq!(cache.snapshot().symbols.len(), 5);
    }

    #[test]
    fn concurrent_readers_never_see_partial_snapshot() {
        let cache = Arc::new(MetadataCache::new());
        cache.replace_snapshot(snapshot_with(10));

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..200 {
                    cache.replace_snapshot(snapshot_with(if i % 2 == 0 { 20 } else { 10 }));
                }
            })
        };

        for _ in 0..1_000 {
            let len = cache.snapshot().symbols.len();
            assert!(len == 10 || len == 20, "torn snapshot with {len} symbols");
        }

        writer.join().unwrap();
    }
}
