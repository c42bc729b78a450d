//! Domain Layer - Core multiplexing types and rules.
//!
//! Pure types with no I/O: channel naming, the subscription table, event
//! classification, exchange metadata, and the small decision functions the
//! services apply (kline trimming, daily snapshot refresh).

/// Kline channel keys.
pub mod channel;

/// Inbound stream event classification.
pub mod event;

/// Exchange metadata snapshot and futures pairs.
pub mod exchange;

/// Historical kline trimming.
pub mod klines;

/// Session lifecycle states.
pub mod session;

/// Subscription tracking.
pub mod subscription;

/// Snapshot refresh schedule.
pub mod sync;
