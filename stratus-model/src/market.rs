use crate::{exchange::ExchangeId, instrument::Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalised market data event published by the Exchange Connector on
/// `market_data.<exchange>.<symbol>`.
///
/// Loss of individual events is tolerated (MarketData delivery class), but
/// per-symbol ordering is preserved end to end.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct MarketEvent {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    /// Exchange timestamp of the underlying update.
    pub time_exchange: DateTime<Utc>,
    /// Connector receive timestamp.
    pub time_received: DateTime<Utc>,
    pub kind: MarketDataKind,
}

impl MarketEvent {
    /// Most recent traded or closing price carried by this event.
    pub fn price(&self) -> Decimal {
        match &self.kind {
            MarketDataKind::Candle(candle) => candle.close,
            MarketDataKind::Ticker(ticker) => ticker.price,
        }
    }

    /// The closed [`Candle`], if this event closed a bar.
    pub fn closed_candle(&self) -> Option<&Candle> {
        match &self.kind {
            MarketDataKind::Candle(candle) if candle.closed => Some(candle),
            _ => None,
        }
    }
}

/// Payload variants of a [`MarketEvent`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::From)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataKind {
    Candle(Candle),
    Ticker(Ticker),
}

/// OHLCV bar. `closed` is true once the bar interval has elapsed; strategies
/// only run indicator population on closed bars.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct Candle {
    pub period: CandlePeriod,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub closed: bool,
}

/// Last-trade ticker update.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct Ticker {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Supported candle intervals.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum CandlePeriod {
    #[serde(alias = "1m")]
    Minute1,
    #[serde(alias = "5m")]
    Minute5,
    #[serde(alias = "15m")]
    Minute15,
    #[serde(alias = "1h")]
    Hour1,
    #[serde(alias = "4h")]
    Hour4,
    #[serde(alias = "1d")]
    Day1,
}

impl CandlePeriod {
    /// Interval in the notation exchanges commonly use ("1m", "1h", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            CandlePeriod::Minute1 => "1m",
            CandlePeriod::Minute5 => "5m",
            CandlePeriod::Minute15 => "15m",
            CandlePeriod::Hour1 => "1h",
            CandlePeriod::Hour4 => "4h",
            CandlePeriod::Day1 => "1d",
        }
    }

    /// Interval duration.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            CandlePeriod::Minute1 => chrono::Duration::minutes(1),
            CandlePeriod::Minute5 => chrono::Duration::minutes(5),
            CandlePeriod::Minute15 => chrono::Duration::minutes(15),
            CandlePeriod::Hour1 => chrono::Duration::hours(1),
            CandlePeriod::Hour4 => chrono::Duration::hours(4),
            CandlePeriod::Day1 => chrono::Duration::days(1),
        }
    }
}
