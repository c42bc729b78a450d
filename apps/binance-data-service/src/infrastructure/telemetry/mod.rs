//! Tracing Setup
//!
//! Installs the global `tracing` subscriber: a fmt layer always, plus an
//! OpenTelemetry OTLP layer when enabled.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full filter override
//! - `OTEL_ENABLED`: set to "true" to export traces (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: service name for traces (default: binance-data-service)
//!
//! Without `RUST_LOG`, this crate logs at the configured level and
//! everything else at `warn`.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_SERVICE_NAME: &str = "binance-data-service";

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

const NOISY_DEPENDENCIES: [&str; 3] = ["h2=warn", "hyper=warn", "tungstenite=warn"];

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A filter directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    /// The OTLP exporter could not be built.
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Level for this crate when `RUST_LOG` is unset.
    pub log_level: Level,
    /// Whether OTLP export is enabled.
    pub otel_enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            otel_enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read the OpenTelemetry variables; `log_level` comes from the
    /// service configuration.
    #[must_use]
    pub fn from_env(log_level: Level) -> Self {
        Self::from_lookup(log_level, |key| std::env::var(key).ok())
    }

    fn from_lookup(log_level: Level, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let otel_enabled = lookup("OTEL_ENABLED")
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"));

        Self {
            log_level,
            otel_enabled,
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        }
    }
}

/// Build the log filter: `RUST_LOG` if set, else the crate at `level`.
fn env_filter(rust_log: Option<&str>, level: Level) -> Result<EnvFilter, TelemetryError> {
    let mut filter = match rust_log.map(str::trim) {
        Some(spec) if !spec.is_empty() => EnvFilter::try_new(spec)?,
        _ => EnvFilter::try_new(format!(
            "warn,binance_data_service={}",
            level.as_str().to_lowercase()
        ))?,
    };

    for directive in NOISY_DEPENDENCIES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process.
///
/// # Errors
///
/// Returns an error if the filter does not parse, the exporter cannot be
/// built, or a subscriber is already installed.
pub fn init(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = env_filter(rust_log.as_deref(), config.log_level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if !config.otel_enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;

        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    }

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(config.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otel_disabled_by_default() {
        let config = TelemetryConfig::from_lookup(Level::DEBUG, |_| None);
        assert!(!config.otel_enabled);
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn otel_enabled_explicitly() {
        let config = TelemetryConfig::from_lookup(Level::INFO, |key| match key {
            "OTEL_ENABLED" => Some("TRUE".to_string()),
            "OTEL_SERVICE_NAME" => Some("data-svc".to_string()),
            _ => None,
        });
        assert!(config.otel_enabled);
        assert_eq!(config.service_name, "data-svc");
        assert_eq!(config.otlp_endpoint, DEFAULT_OTLP_ENDPOINT);
    }

    #[test]
    fn filter_defaults_to_crate_level() {
        let filter = env_filter(None, Level::DEBUG).unwrap();
        assert!(filter.to_string().contains("binance_data_service=debug"));
    }

    #[test]
    fn rust_log_overrides() {
        let filter = env_filter(Some("binance_data_service=trace"), Level::INFO).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("binance_data_service=trace"));
        assert!(!rendered.contains("binance_data_service=info"));
    }

    #[test]
    fn invalid_rust_log_is_an_error() {
        assert!(env_filter(Some("binance_data_service=loud"), Level::INFO).is_err());
    }
}
