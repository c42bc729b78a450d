//! Service Configuration Settings
//!
//! Configuration types for the data service, loaded from environment
//! variables. Unset variables fall back to defaults; set variables that do
//! not parse are an error rather than silently ignored.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::Level;

use crate::infrastructure::binance::{
    DEFAULT_REST_URL, DEFAULT_STREAM_URL, ReconnectConfig, RestConfig, StreamConfig,
};

/// Server and session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// gRPC listen address.
    pub grpc_addr: SocketAddr,
    /// Health/metrics HTTP port (0 = disabled).
    pub health_port: u16,
    /// How long shutdown waits for sessions to drain.
    pub shutdown_grace: Duration,
    /// Per-session sink capacity.
    pub sink_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            health_port: 8083,
            shutdown_grace: Duration::from_secs(5),
            sink_capacity: 256,
        }
    }
}

/// WebSocket reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

/// Exchange endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct BinanceSettings {
    /// REST base URL.
    pub rest_url: String,
    /// Combined-stream websocket URL.
    pub stream_url: String,
    /// REST request timeout.
    pub http_timeout: Duration,
    /// Websocket reconnection.
    pub websocket: WebSocketSettings,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            http_timeout: Duration::from_secs(10),
            websocket: WebSocketSettings::default(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Server and session settings.
    pub server: ServerSettings,
    /// Exchange endpoints.
    pub binance: BinanceSettings,
    /// Synchronization loop tick.
    pub sync_interval: Duration,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: Level,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            binance: BinanceSettings::default(),
            sync_interval: Duration::from_secs(30 * 60),
            log_level: Level::INFO,
        }
    }
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an empty or unparsable
    /// value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an empty or unparsable
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let defaults = Self::default();

        let grpc_addr = match env.get("DATA_SERVICE_GRPC_ADDR") {
            None => defaults.server.grpc_addr,
            Some(raw) if raw.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("DATA_SERVICE_GRPC_ADDR".to_string()));
            }
            Some(raw) => parse("DATA_SERVICE_GRPC_ADDR", &raw)?,
        };

        let log_level = env
            .parse("DATA_SERVICE_LOG_LEVEL")?
            .unwrap_or(defaults.log_level);

        let server = ServerSettings {
            grpc_addr,
            health_port: env
                .parse("DATA_SERVICE_HEALTH_PORT")?
                .unwrap_or(defaults.server.health_port),
            shutdown_grace: env
                .parse("DATA_SERVICE_SHUTDOWN_GRACE_SECS")?
                .map_or(defaults.server.shutdown_grace, Duration::from_secs),
            sink_capacity: env
                .positive("DATA_SERVICE_SINK_CAPACITY")?
                .unwrap_or(defaults.server.sink_capacity),
        };

        let sync_interval = env
            .positive("DATA_SERVICE_SYNC_INTERVAL_SECS")?
            .map_or(defaults.sync_interval, Duration::from_secs);

        let websocket = WebSocketSettings {
            reconnect_delay_initial: env
                .parse("BINANCE_RECONNECT_DELAY_INITIAL_MS")?
                .map_or(defaults.binance.websocket.reconnect_delay_initial, Duration::from_millis),
            reconnect_delay_max: env
                .parse("BINANCE_RECONNECT_DELAY_MAX_SECS")?
                .map_or(defaults.binance.websocket.reconnect_delay_max, Duration::from_secs),
            reconnect_delay_multiplier: env
                .parse("BINANCE_RECONNECT_MULTIPLIER")?
                .unwrap_or(defaults.binance.websocket.reconnect_delay_multiplier),
            max_reconnect_attempts: env
                .parse("BINANCE_MAX_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.binance.websocket.max_reconnect_attempts),
        };

        let binance = BinanceSettings {
            rest_url: env.non_empty("BINANCE_REST_URL")?.unwrap_or(defaults.binance.rest_url),
            stream_url: env
                .non_empty("BINANCE_STREAM_URL")?
                .unwrap_or(defaults.binance.stream_url),
            http_timeout: env
                .positive("BINANCE_HTTP_TIMEOUT_SECS")?
                .map_or(defaults.binance.http_timeout, Duration::from_secs),
            websocket,
        };

        Ok(Self {
            server,
            binance,
            sync_interval,
            log_level,
        })
    }

    /// REST client settings.
    #[must_use]
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.binance.rest_url.clone(),
            timeout: self.binance.http_timeout,
        }
    }

    /// Stream client settings.
    #[must_use]
    pub fn stream_config(&self) -> StreamConfig {
        let ws = &self.binance.websocket;
        StreamConfig {
            url: self.binance.stream_url.clone(),
            reconnect: ReconnectConfig {
                initial_delay: ws.reconnect_delay_initial,
                max_delay: ws.reconnect_delay_max,
                multiplier: ws.reconnect_delay_multiplier,
                max_attempts: ws.max_reconnect_attempts,
                ..ReconnectConfig::default()
            },
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key).map(|raw| parse(key, &raw)).transpose()
    }

    fn positive<T: FromStr + Default + PartialOrd>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let value: T = parse(key, &raw)?;
                if value > T::default() {
                    Ok(Some(value))
                } else {
                    Err(invalid(key, &raw))
                }
            }
        }
    }

    fn non_empty(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            Some(raw) if raw.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            other => Ok(other.map(|v| v.trim().to_string())),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(key, raw))
}

fn invalid(key: &str, raw: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.server.grpc_addr.port(), 50051);
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.sync_interval, Duration::from_secs(1800));
        assert_eq!(config.binance.rest_url, "https://fapi.binance.com");
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn overrides_apply() {
        let config = config(&[
            ("DATA_SERVICE_GRPC_ADDR", "127.0.0.1:6000"),
            ("DATA_SERVICE_LOG_LEVEL", "debug"),
            ("DATA_SERVICE_HEALTH_PORT", "0"),
            ("DATA_SERVICE_SYNC_INTERVAL_SECS", "60"),
            ("DATA_SERVICE_SINK_CAPACITY", "16"),
            ("BINANCE_STREAM_URL", "ws://localhost:9000/stream"),
            ("BINANCE_RECONNECT_MULTIPLIER", "1.5"),
            ("BINANCE_MAX_RECONNECT_ATTEMPTS", "4"),
        ])
        .unwrap();

        assert_eq!(config.server.grpc_addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.server.health_port, 0);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.server.sink_capacity, 16);

        let stream = config.stream_config();
        assert_eq!(stream.url, "ws://localhost:9000/stream");
        assert!((stream.reconnect.multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(stream.reconnect.max_attempts, 4);
    }

    #[test]
    fn empty_grpc_addr_is_fatal() {
        assert_eq!(
            config(&[("DATA_SERVICE_GRPC_ADDR", " ")]).unwrap_err(),
            ConfigError::EmptyValue("DATA_SERVICE_GRPC_ADDR".to_string())
        );
    }

    #[test_case("DATA_SERVICE_GRPC_ADDR", "not-an-addr")]
    #[test_case("DATA_SERVICE_LOG_LEVEL", "loud")]
    #[test_case("DATA_SERVICE_HEALTH_PORT", "70000")]
    #[test_case("DATA_SERVICE_SYNC_INTERVAL_SECS", "0")]
    #[test_case("DATA_SERVICE_SINK_CAPACITY", "-1")]
    #[test_case("BINANCE_HTTP_TIMEOUT_SECS", "ten")]
    #[test_case("BINANCE_RECONNECT_MULTIPLIER", "x2")]
    fn unparsable_values_are_fatal(key: &str, value: &str) {
        let err = config(&[(key, value)]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: k, .. } if k == key));
    }

    #[test]
    fn rest_config_uses_settings() {
        let config = config(&[
            ("BINANCE_REST_URL", "http://localhost:8080"),
            ("BINANCE_HTTP_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        let rest = config.rest_config();
        assert_eq!(rest.base_url, "http://localhost:8080");
        assert_eq!(rest.timeout, Duration::from_secs(3));
    }
}
