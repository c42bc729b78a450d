//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the services that coordinate the domain with the
//! exchange adapters: the subscription multiplexer, downstream sessions,
//! the metadata synchronization loop, and the request handlers.

/// Port interfaces for the exchange stream and REST API.
pub mod ports;

/// Application services.
pub mod services;
