//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Binance REST and combined-stream adapters.
pub mod binance;

/// gRPC server implementation.
pub mod grpc;

/// Configuration from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
