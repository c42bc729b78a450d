//! Exchange Metadata
//!
//! The exchange-info snapshot is fetched in one piece and replaced
//! wholesale; nothing in it is ever mutated after construction. Field
//! names follow the `/fapi/v1/exchangeInfo` payload so the snapshot can be
//! deserialized directly.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Contract type served by `GetFuturesPairs`.
pub const CONTRACT_PERPETUAL: &str = "PERPETUAL";

/// Symbol status served by `GetFuturesPairs`.
pub const STATUS_TRADING: &str = "TRADING";

/// Filter carrying the price tick size.
pub const PRICE_FILTER: &str = "PRICE_FILTER";

/// Filter carrying the market-order lot step.
pub const MARKET_LOT_SIZE: &str = "MARKET_LOT_SIZE";

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable copy of exchange metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeSnapshot {
    /// Every listed symbol, in exchange order.
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,

    /// When the snapshot was fetched; `None` for the empty startup value.
    #[serde(skip)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ExchangeSnapshot {
    /// Stamp the snapshot with its fetch time.
    #[must_use]
    pub fn with_fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(at);
        self
    }

    /// Whether a real snapshot has been loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.fetched_at.is_some()
    }

    /// Perpetual contracts that are currently trading.
    #[must_use]
    pub fn futures_pairs(&self) -> Vec<FuturesPair> {
        self.symbols
            .iter()
            .filter(|s| s.is_tradable_perpetual())
            .map(FuturesPair::from)
            .collect()
    }
}

/// One entry of the `symbols` array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolInfo {
    /// Trading symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Base asset, e.g. `BTC`.
    pub base_asset: String,
    /// `PERPETUAL`, `CURRENT_QUARTER`, ...
    pub contract_type: String,
    /// `TRADING`, `SETTLING`, ...
    pub status: String,
    /// Trading rules.
    pub filters: Vec<SymbolFilter>,
}

impl SymbolInfo {
    fn is_tradable_perpetual(&self) -> bool {
        self.contract_type == CONTRACT_PERPETUAL && self.status == STATUS_TRADING
    }

    /// Parsed numeric field of the first filter with the given tag.
    ///
    /// Missing filters and unparsable values both yield 0.
    fn filter_value(&self, filter_type: &str, pick: impl Fn(&SymbolFilter) -> Option<&str>) -> f64 {
        self.filters
            .iter()
            .find(|f| f.filter_type == filter_type)
            .and_then(pick)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

/// Trading rule attached to a symbol. Only the fields the service reads
/// are kept; values stay as the exchange's decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolFilter {
    /// Filter tag, e.g. `PRICE_FILTER`.
    pub filter_type: String,
    /// Price increment (`PRICE_FILTER`).
    pub tick_size: Option<String>,
    /// Quantity increment (`MARKET_LOT_SIZE`, `LOT_SIZE`).
    pub min_qty: Option<String>,
}

// =============================================================================
// Futures Pairs
// =============================================================================

/// Tradable perpetual with its order-size increments.
#[derive(Debug, Clone, PartialEq)]
pub struct FuturesPair {
    /// Trading symbol.
    pub symbol: String,
    /// Base asset.
    pub base_asset: String,
    /// Price tick size, 0 when unknown.
    pub price_step: f64,
    /// Market lot step, 0 when unknown.
    pub lot_step: f64,
}

impl From<&SymbolInfo> for FuturesPair {
    fn from(info: &SymbolInfo) -> Self {
        Self {
            symbol: info.symbol.clone(),
            base_asset: info.base_asset.clone(),
            price_step: info.filter_value(PRICE_FILTER, |f| f.tick_size.as_deref()),
            lot_step: info.filter_value(MARKET_LOT_SIZE, |f| f.min_qty.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(name: &str, contract_type: &str, status: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: name.to_string(),
            base_asset: name.trim_end_matches("USDT").to_string(),
            contract_type: contract_type.to_string(),
            status: status.to_string(),
            filters: vec![
                SymbolFilter {
                    filter_type: PRICE_FILTER.to_string(),
                    tick_size: Some("0.10".to_string()),
                    min_qty: None,
                },
                SymbolFilter {
                    filter_type: MARKET_LOT_SIZE.to_string(),
                    tick_size: None,
                    min_qty: Some("0.001".to_string()),
                },
            ],
        }
    }

    #[test]
    fn only_trading_perpetuals_are_pairs() {
        let snapshot = ExchangeSnapshot {
            symbols: vec![
                symbol("BTCUSDT", "PERPETUAL", "TRADING"),
                symbol("ETHUSDT_250328", "CURRENT_QUARTER", "TRADING"),
                symbol("LUNAUSDT", "PERPETUAL", "SETTLING"),
            ],
            fetched_at: None,
        };

        let pairs = snapshot.futures_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].symbol, "BTCUSDT");
        assert_eq!(pairs[0].base_asset, "BTC");
        assert_eq!(pairs[0].price_step, 0.1);
        assert_eq!(pairs[0].lot_step, 0.001);
    }

    #[test]
    fn missing_filters_keep_zero_steps() {
        let mut info = symbol("XRPUSDT", "PERPETUAL", "TRADING");
        info.filters.clear();

        let pair = FuturesPair::from(&info);
        assert_eq!(pair.price_step, 0.0);
        assert_eq!(pair.lot_step, 0.0);
    }

    #[test]
    fn unparsable_filter_value_is_zero() {
        let mut info = symbol("XRPUSDT", "PERPETUAL", "TRADING");
        info.filters[0].tick_size = Some("n/a".to_string());

        let pair = FuturesPair::from(&info);
        assert_eq!(pair.price_step, 0.0);
        assert_eq!(pair.lot_step, 0.001);
    }

    #[test]
    fn deserializes_exchange_info_payload() {
        let json = r#"{
            "timezone": "UTC",
            "serverTime": 1700000000000,
            "symbols": [{
                "symbol": "BTCUSDT",
                "pair": "BTCUSDT",
                "contractType": "PERPETUAL",
                "status": "TRADING",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "556.80", "maxPrice": "4529764", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.002", "maxQty": "120"}
                ]
            }]
        }"#;

        let snapshot: ExchangeSnapshot = serde_json::from_str(json).unwrap();
        assert!(!snapshot.is_loaded());

        let pairs = snapshot.futures_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].price_step, 0.1);
        assert_eq!(pairs[0].lot_step, 0.002);
    }

    #[test]
    fn empty_snapshot_is_not_loaded() {
        let snapshot = ExchangeSnapshot::default();
        assert!(!snapshot.is_loaded());
        assert!(snapshot.futures_pairs().is_empty());
        assert!(snapshot.with_fetched_at(Utc::now()).is_loaded());
    }
}
