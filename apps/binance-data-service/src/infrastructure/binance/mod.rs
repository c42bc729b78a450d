//! Binance USD-M Futures Adapters
//!
//! - **REST**: server time, exchange info, historical klines
//! - **Stream**: combined-stream websocket with reconnect and resubscribe
//! - **Dispatch**: feed events into the multiplexer

pub mod codec;
pub mod dispatch;
pub mod reconnect;
pub mod rest;
pub mod stream;

pub use codec::{CodecError, Command, Frame};
pub use dispatch::{FeedDispatcher, FeedState, FeedStatus};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::{BinanceRest, DEFAULT_REST_URL, RestConfig};
pub use stream::{DEFAULT_STREAM_URL, StreamClient, StreamConfig, StreamError, StreamHandle, stream_client};
