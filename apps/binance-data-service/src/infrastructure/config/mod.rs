//! Configuration Module
//!
//! Environment-driven configuration for the data service.

mod settings;

pub use settings::{
    BinanceSettings, ConfigError, ServerSettings, ServiceConfig, WebSocketSettings,
};
