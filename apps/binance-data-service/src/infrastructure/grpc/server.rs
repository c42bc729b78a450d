//! gRPC Server Implementation
//!
//! Implements the `DataService` gRPC service: unary market data lookups and
//! the bidirectional kline stream.

use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::proto::binance::v1::{
    self as proto, FuturesPairsResponse, KlinesRequest, KlinesResponse, ServerTime,
    SocketRequest, SocketResponse, Void, data_service_server::DataService,
};
use crate::application::services::{
    ChannelRequest, HandlerError, MarketDataService, SessionError, SessionRegistry,
};
use crate::domain::exchange::FuturesPair;

// =============================================================================
// Type Aliases
// =============================================================================

type RpcResult<T> = Result<Response<T>, Status>;
type BoxedStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the gRPC server.
#[derive(Debug, Clone)]
pub struct DataServerConfig {
    /// Buffer between a session and its response stream.
    pub outbound_capacity: usize,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<SocketRequest> for ChannelRequest {
    fn from(request: SocketRequest) -> Self {
        Self {
            symbol: request.symbol,
            interval: request.interval,
            subscribe: request.is_subscribe,
        }
    }
}

impl From<FuturesPair> for proto::FuturesPair {
    fn from(pair: FuturesPair) -> Self {
        Self {
            symbol: pair.symbol,
            base_asset: pair.base_asset,
            price_step: pair.price_step,
            lot_step: pair.lot_step,
        }
    }
}

/// Map a handler error onto a gRPC status.
#[must_use]
pub fn handler_status(err: HandlerError) -> Status {
    match err {
        HandlerError::InvalidArgument(msg) => Status::invalid_argument(msg),
        HandlerError::Unavailable(e) => Status::unavailable(e.to_string()),
    }
}

#[allow(clippy::unnecessary_wraps)]
fn socket_response(response: String) -> Result<SocketResponse, Status> {
    Ok(SocketResponse { response })
}

// =============================================================================
// gRPC Server
// =============================================================================

/// gRPC data server.
pub struct DataServer {
    config: DataServerConfig,
    market: Arc<MarketDataService>,
    sessions: Arc<SessionRegistry>,
}

impl DataServer {
    /// Create a new data server.
    #[must_use]
    pub const fn new(
        config: DataServerConfig,
        market: Arc<MarketDataService>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            market,
            sessions,
        }
    }
}

#[tonic::async_trait]
impl DataService for DataServer {
    type GetSocketDataStream = BoxedStream<SocketResponse>;

    async fn get_time(&self, _request: Request<Void>) -> RpcResult<ServerTime> {
        let time = self.market.server_time().await.map_err(handler_status)?;
        Ok(Response::new(ServerTime { time }))
    }

    async fn get_klines(&self, request: Request<KlinesRequest>) -> RpcResult<KlinesResponse> {
        let req = request.into_inner();

        let klines = self
            .market
            .klines(&req.symbol, &req.interval, req.limit)
            .await
            .map_err(|e| {
                tracing::debug!(
                    symbol = %req.symbol,
                    interval = %req.interval,
                    error = %e,
                    "GetKlines failed"
                );
                handler_status(e)
            })?;

        Ok(Response::new(KlinesResponse { klines }))
    }

    async fn get_futures_pairs(
        &self,
        _request: Request<Void>,
    ) -> RpcResult<FuturesPairsResponse> {
        let pairs = self
            .market
            .futures_pairs()
            .into_iter()
            .map(proto::FuturesPair::from)
            .collect();

        Ok(Response::new(FuturesPairsResponse { pairs }))
    }

    async fn get_socket_data(
        &self,
        request: Request<Streaming<SocketRequest>>,
    ) -> RpcResult<Self::GetSocketDataStream> {
        let inbound = request
            .into_inner()
            .map(|item| item.map(ChannelRequest::from));

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity);

        let control = self
            .sessions
            .spawn(inbound, tx, socket_response)
            .map_err(|e| match e {
                SessionError::ShuttingDown => Status::unavailable(e.to_string()),
            })?;

        tracing::info!(session_id = control.id(), "Socket session opened");

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::GetSocketDataStream))
    }
}

// =============================================================================
// Tests
// =============================================================================
