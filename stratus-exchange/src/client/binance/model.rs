//! Wire DTOs for Binance-style spot venues. Nothing here leaks past the
//! client module; everything is normalised into the internal vocabulary at
//! the boundary.

use crate::error::ExchangeError;
use rust_decimal::Decimal;
use serde::Deserialize;
use stratus_model::{instrument::Symbol, order::TradeStatus, Side};

/// Quote assets recognised when translating an exchange symbol ("BTCUSDT")
/// back to internal notation ("BTC/USDT").
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "FDUSD", "TUSD", "BUSD", "BTC", "ETH", "BNB"];

/// "BTC/USDT" -> "BTCUSDT".
pub(crate) fn to_exchange_symbol(symbol: &Symbol) -> String {
    symbol.as_ref().replace('/', "")
}

/// "BTCUSDT" -> "BTC/USDT", by longest-known-quote suffix.
pub(crate) fn from_exchange_symbol(name: &str) -> Option<Symbol> {
    KNOWN_QUOTES
        .iter()
        .filter(|quote| name.len() > quote.len() && name.ends_with(**quote))
        .max_by_key(|quote| quote.len())
        .map(|quote| {
            let base = &name[..name.len() - quote.len()];
            Symbol::new(format!("{base}/{quote}"))
        })
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorResponse {
    pub code: i64,
    pub msg: String,
}

impl ErrorResponse {
    /// Classify a venue error body by its numeric code.
    pub fn classify(&self, http_status: u16) -> ExchangeError {
        match (http_status, self.code) {
            (418 | 429, _) | (_, -1003) => ExchangeError::RateLimited(self.msg.clone()),
            (500..=599, _) | (_, -1000 | -1001 | -1021) => {
                ExchangeError::Transient(format!("{}: {}", self.code, self.msg))
            }
            _ => ExchangeError::Permanent(format!("{}: {}", self.code, self.msg)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderResponse {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    #[serde(default)]
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    pub side: String,
    #[serde(default)]
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Fill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
}

impl OrderResponse {
    pub fn trade_status(&self) -> Result<TradeStatus, ExchangeError> {
        match self.status.as_str() {
            "NEW" => Ok(TradeStatus::Open),
            "PARTIALLY_FILLED" => Ok(TradeStatus::Partial),
            "FILLED" => Ok(TradeStatus::Filled),
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(TradeStatus::Canceled),
            "REJECTED" => Ok(TradeStatus::Rejected),
            "PENDING_NEW" => Ok(TradeStatus::Submitted),
            other => Err(ExchangeError::Permanent(format!(
                "unrecognised order status {other}"
            ))),
        }
    }

    pub fn trade_side(&self) -> Result<Side, ExchangeError> {
        match self.side.as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(ExchangeError::Permanent(format!(
                "unrecognised side {other}"
            ))),
        }
    }

    /// Volume-weighted fill price, preferring the venue's cumulative quote
    /// figure over summing partial fills.
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.executed_qty.is_zero() {
            return None;
        }
        if !self.cummulative_quote_qty.is_zero() {
            return Some(self.cummulative_quote_qty / self.executed_qty);
        }
        let quantity: Decimal = self.fills.iter().map(|fill| fill.qty).sum();
        if quantity.is_zero() {
            return self.price;
        }
        let notional: Decimal = self.fills.iter().map(|fill| fill.price * fill.qty).sum();
        Some(notional / quantity)
    }

    pub fn total_fee(&self) -> Option<Decimal> {
        if self.fills.is_empty() {
            return None;
        }
        Some(self.fills.iter().map(|fill| fill.commission).sum())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountResponse {
    pub balances: Vec<BalanceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BalanceEntry {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// A kline row: `[open_time, open, high, low, close, volume, close_time, ...]`
/// with prices as strings and timestamps as integer millis.
pub(crate) type KlineRow = (
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
);
