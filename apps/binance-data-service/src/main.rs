//! Binance Data Service Binary
//!
//! Starts the kline multiplexer and its gRPC server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin binance-data-service
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//! - `DATA_SERVICE_GRPC_ADDR`: gRPC listen address (default: 0.0.0.0:50051)
//! - `DATA_SERVICE_LOG_LEVEL`: trace | debug | info | warn | error (default: info)
//! - `DATA_SERVICE_HEALTH_PORT`: Health/metrics HTTP port, 0 disables (default: 8083)
//! - `DATA_SERVICE_SYNC_INTERVAL_SECS`: Metadata sync tick (default: 1800)
//! - `DATA_SERVICE_SHUTDOWN_GRACE_SECS`: Session drain grace (default: 5)
//! - `DATA_SERVICE_SINK_CAPACITY`: Per-session buffer (default: 256)
//! - `BINANCE_REST_URL`, `BINANCE_STREAM_URL`: Exchange endpoints
//! - `BINANCE_HTTP_TIMEOUT_SECS`: REST timeout (default: 10)
//! - `BINANCE_RECONNECT_*`, `BINANCE_MAX_RECONNECT_ATTEMPTS`: Websocket backoff
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: binance-data-service)
//! - `RUST_LOG`: Full log filter override

use std::sync::Arc;
use std::time::Duration;

use binance_data_service::application::ports::{ApiError, ExchangeApi, FeedEvent};
use binance_data_service::infrastructure::telemetry::{self, TelemetryConfig, TelemetryError};
use binance_data_service::proto::data_service_server::DataServiceServer;
use binance_data_service::{
    BinanceRest, ConfigError, DataServer, DataServerConfig, FeedDispatcher, FeedStatus,
    HealthServer, HealthServerState, MarketDataService, MetadataCache, Multiplexer,
    ServiceConfig, SessionRegistry, SyncLoop, init_metrics, stream_client,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

/// Buffer between the websocket client and the dispatcher.
const FEED_EVENT_BUFFER: usize = 1024;

/// Bound on waiting for a background task during shutdown.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup and serving failures.
#[derive(Debug, thiserror::Error)]
enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("metrics error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to install rustls crypto provider")]
    CryptoProvider,

    #[error("exchange client error: {0}")]
    Api(#[from] ApiError),

    #[error("failed to bind gRPC listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| ServiceError::CryptoProvider)?;

    load_dotenv();

    let config = ServiceConfig::from_env().map_err(ServiceError::from)?;

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard =
        telemetry::init(&TelemetryConfig::from_env(config.log_level)).map_err(ServiceError::from)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Binance data service");
    log_config(&config);

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics().map_err(ServiceError::from)?;

    run(config).await?;

    tracing::info!("Binance data service stopped");
    Ok(())
}

async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    // Claim the gRPC port before anything connects or serves
    let listener = TcpListener::bind(config.server.grpc_addr).await?;
    let grpc_addr = listener.local_addr()?;

    let api: Arc<dyn ExchangeApi> = Arc::new(BinanceRest::new(&config.rest_config())?);
    let cache = Arc::new(MetadataCache::new());

    // Upstream stream: client task, dispatcher task, shared multiplexer
    let stream_token = CancellationToken::new();
    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(FEED_EVENT_BUFFER);
    let (stream_handle, client) =
        stream_client(config.stream_config(), feed_tx, stream_token.clone());

    let multiplexer = Arc::new(Multiplexer::new(Arc::new(stream_handle)));
    let feed_status = Arc::new(FeedStatus::new());
    let dispatcher =
        FeedDispatcher::new(feed_rx, Arc::clone(&multiplexer), Arc::clone(&feed_status));

    let client_task = tokio::spawn(client.run());
    let dispatcher_task = tokio::spawn(dispatcher.run());

    // Metadata synchronization
    let sync_token = CancellationToken::new();
    let sync_loop = SyncLoop::new(
        Arc::clone(&api),
        Arc::clone(&cache),
        config.sync_interval,
        sync_token.clone(),
    );
    if let Err(e) = sync_loop.prime().await {
        tracing::warn!(error = %e, "Initial synchronization failed, retrying on next tick");
    }
    let sync_task = tokio::spawn(sync_loop.run());

    // Sessions and handlers
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&multiplexer),
        config.server.sink_capacity,
    ));
    let market = Arc::new(MarketDataService::new(api, Arc::clone(&cache)));

    // Health server
    let health_token = CancellationToken::new();
    let health_task = (config.server.health_port != 0).then(|| {
        let state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&feed_status),
            Arc::clone(&multiplexer),
            Arc::clone(&registry),
            Arc::clone(&cache),
        ));
        let server = HealthServer::new(config.server.health_port, state, health_token.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        })
    });

    // gRPC server
    let grpc_service = DataServiceServer::new(DataServer::new(
        DataServerConfig::default(),
        market,
        Arc::clone(&registry),
    ));
    let grpc_shutdown = CancellationToken::new();
    let grpc_signal = grpc_shutdown.clone();

    let server_task = tokio::spawn(async move {
        tracing::info!(addr = %grpc_addr, "gRPC server listening");
        if let Err(e) = Server::builder()
            .add_service(grpc_service)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                grpc_signal.cancelled_owned(),
            )
            .await
        {
            tracing::error!(error = %e, "gRPC server error");
        }
        tracing::info!("gRPC server stopped");
    });

    tracing::info!("Data service ready");

    await_shutdown().await;

    // 1. Refuse new sessions
    registry.close();
    grpc_shutdown.cancel();

    // 2. Drain live sessions
    registry.drain(config.server.shutdown_grace).await;

    // 3. Stop synchronization
    sync_token.cancel();
    join_task("sync loop", sync_task).await;

    // 4. Close the upstream, then the websocket client
    let released = multiplexer.shutdown();
    tracing::info!(channels = released.len(), "Upstream subscriptions released");
    stream_token.cancel();
    join_task("stream client", client_task).await;
    join_task("feed dispatcher", dispatcher_task).await;

    // 5. Release the listener
    join_task("gRPC server", server_task).await;

    health_token.cancel();
    if let Some(task) = health_task {
        join_task("health server", task).await;
    }

    Ok(())
}

/// Await a background task, giving up after [`TASK_STOP_TIMEOUT`].
async fn join_task(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(TASK_STOP_TIMEOUT, task).await {
        Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task failed"),
        Err(_) => tracing::warn!(
            task = name,
            timeout_secs = TASK_STOP_TIMEOUT.as_secs(),
            "Task did not stop in time"
        ),
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        grpc_addr = %config.server.grpc_addr,
        health_port = config.server.health_port,
        sync_interval_secs = config.sync_interval.as_secs(),
        shutdown_grace_secs = config.server.shutdown_grace.as_secs(),
        sink_capacity = config.server.sink_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        rest_url = %config.binance.rest_url,
        stream_url = %config.binance.stream_url,
        "Exchange endpoints"
    );
}

/// Walk up from the current directory looking for a `.env` file.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_grpc_port_fails_before_startup() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = ServiceConfig::default();
        config.server.grpc_addr = taken.local_addr().unwrap();
        config.server.health_port = 0;
        config.binance.rest_url = "http://127.0.0.1:9".to_string();

        let result = tokio::time::timeout(Duration::from_secs(1), run(config))
            .await
            .expect("bind failure should return immediately");

        assert!(matches!(result, Err(ServiceError::Bind(_))));
    }
}
