//! gRPC Server
//!
//! Implements the `binance.v1.DataService` RPCs on top of the application
//! services.
//!
//! # Architecture
//!
//! Unary calls (`GetTime`, `GetKlines`, `GetFuturesPairs`) go straight to
//! [`MarketDataService`](crate::application::services::MarketDataService).
//! `GetSocketData` hands its bidirectional stream to the
//! [`SessionRegistry`](crate::application::services::SessionRegistry):
//!
//! 1. Client requests are converted into channel requests
//! 2. The session subscribes and unsubscribes through the multiplexer
//! 3. Forwarded events flow back as `SocketResponse` messages
//! 4. Subscriptions are released when either side goes away

pub mod server;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod binance {
        pub mod v1 {
            include!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../../packages/schema-gen/rust/binance/v1/binance.v1.rs"
            ));
        }
    }
}

pub use server::{DataServer, DataServerConfig, handler_status};
