//! Request/Response Handlers
//!
//! `GetTime`, `GetKlines` and `GetFuturesPairs`, independent of the RPC
//! transport. The gRPC layer only converts messages and maps
//! [`HandlerError`] onto status codes.

use std::sync::Arc;

use thiserror::Error;

use super::metadata::MetadataCache;
use crate::application::ports::{ApiError, ExchangeApi};
use crate::domain::exchange::FuturesPair;
use crate::domain::klines::{TrimmedEdge, trim_bars};

/// Handler errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The exchange could not answer.
    #[error("upstream unavailable: {0}")]
    Unavailable(#[from] ApiError),
}

/// Handlers backed by the exchange API and the metadata cache.
pub struct MarketDataService {
    api: Arc<dyn ExchangeApi>,
    cache: Arc<MetadataCache>,
}

impl MarketDataService {
    /// Create the service.
    #[must_use]
    pub fn new(api: Arc<dyn ExchangeApi>, cache: Arc<MetadataCache>) -> Self {
        Self { api, cache }
    }

    /// Exchange server time in epoch milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Unavailable`] if the exchange cannot report
    /// its time.
    pub async fn server_time(&self) -> Result<i64, HandlerError> {
        Ok(self.api.server_time().await?)
    }

    /// The `limit` most recent closed bars as raw JSON arrays, oldest first.
    ///
    /// One extra bar is requested and then trimmed, so the result never
    /// contains the bar that is still forming.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidArgument`] for an empty symbol or
    /// interval or a non-positive limit, and [`HandlerError::Unavailable`]
    /// if the exchange query fails.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: i64,
    ) -> Result<Vec<String>, HandlerError> {
        let symbol = symbol.trim();
        let interval = interval.trim();

        if symbol.is_empty() {
            return Err(HandlerError::InvalidArgument("symbol is empty".into()));
        }
        if interval.is_empty() {
            return Err(HandlerError::InvalidArgument("interval is empty".into()));
        }
        let wanted = u32::try_from(limit)
            .ok()
            .filter(|l| *l > 0 && *l < u32::MAX)
            .ok_or_else(|| HandlerError::InvalidArgument(format!("limit {limit} out of range")))?;

        let fetched = self.api.klines(symbol, interval, wanted + 1).await?;
        let received = fetched.len();

        if received != wanted as usize + 1 {
            tracing::warn!(
                symbol,
                interval,
                requested = wanted + 1,
                received,
                "Exchange returned unexpected kline count"
            );
        }

        let trimmed = trim_bars(fetched, self.cache.corrected_now_ms());
        if trimmed.edge == TrimmedEdge::FormingTail {
            tracing::trace!(symbol, interval, "Dropped forming bar");
        }

        Ok(trimmed.bars.into_iter().map(|bar| bar.raw).collect())
    }

    /// Tradable perpetual contracts from the current snapshot.
    #[must_use]
    pub fn futures_pairs(&self) -> Vec<FuturesPair> {
        self.cache.snapshot().futures_pairs()
    }
}
