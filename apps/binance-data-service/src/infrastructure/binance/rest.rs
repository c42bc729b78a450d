//! USD-M Futures REST Client
//!
//! Public, unsigned endpoints only:
//!
//! | Endpoint | Use |
//! |---|---|
//! | `GET /fapi/v1/time` | clock offset |
//! | `GET /fapi/v1/exchangeInfo` | symbol snapshot |
//! | `GET /fapi/v1/klines` | historical bars |

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::application::ports::{ApiError, ExchangeApi};
use crate::domain::exchange::ExchangeSnapshot;
use crate::domain::klines::RawBar;

/// Production REST base.
pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";

const TIME_PATH: &str = "/fapi/v1/time";
const EXCHANGE_INFO_PATH: &str = "/fapi/v1/exchangeInfo";
const KLINES_PATH: &str = "/fapi/v1/klines";

/// Kline row index of the close time.
const CLOSE_TIME_INDEX: usize = 6;

/// REST client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REST_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime", default)]
    server_time: i64,
}

/// REST adapter for [`ExchangeApi`].
#[derive(Debug, Clone)]
pub struct BinanceRest {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRest {
    /// Build the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the client cannot be built.
    pub fn new(config: &RestConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(url = %url, ?query, "GET");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(path, error = %e, "Failed to parse response");
            ApiError::Decode(e.to_string())
        })
    }
}

fn raw_bar(row: &serde_json::Value) -> Result<RawBar, ApiError> {
    let close_time = row
        .as_array()
        .and_then(|fields| fields.get(CLOSE_TIME_INDEX))
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| ApiError::Decode(format!("kline row without close time: {row}")))?;

    Ok(RawBar {
        raw: row.to_string(),
        close_time,
    })
}

#[async_trait]
impl ExchangeApi for BinanceRest {
    async fn server_time(&self) -> Result<i64, ApiError> {
        let time: ServerTime = self.get(TIME_PATH, &[]).await?;
        if time.server_time <= 0 {
            return Err(ApiError::NoServerTime);
        }
        Ok(time.server_time)
    }

    async fn exchange_info(&self) -> Result<ExchangeSnapshot, ApiError> {
        self.get(EXCHANGE_INFO_PATH, &[]).await
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<RawBar>, ApiError> {
        let rows: Vec<serde_json::Value> = self
            .get(
                KLINES_PATH,
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        rows.iter().map(raw_bar).collect()
    }
}
