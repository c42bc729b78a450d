//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - [`Multiplexer`]: shared channel table and upstream deduplication
//! - [`Session`] / [`SessionRegistry`]: per-client streaming lifecycle
//! - [`MetadataCache`] / [`SyncLoop`]: clock offset and exchange snapshot
//! - [`MarketDataService`]: request/response handlers

pub mod market_data;
pub mod metadata;
pub mod multiplexer;
pub mod session;
pub mod sync_loop;

pub use market_data::{HandlerError, MarketDataService};
pub use metadata::MetadataCache;
pub use multiplexer::{
    Dispatch, DropReason, Multiplexer, MultiplexerError, MultiplexerStats, Sink, UpstreamOp,
};
pub use session::{
    ChannelRequest, DEFAULT_SINK_CAPACITY, Session, SessionControl, SessionError, SessionRegistry,
};
pub use sync_loop::{DEFAULT_SYNC_INTERVAL, SyncLoop, SyncOutcome};
