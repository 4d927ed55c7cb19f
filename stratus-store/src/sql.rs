//! Row conversion helpers shared by the repositories.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use stratus_model::{
    exchange::ExchangeId,
    order::{OrderKind, TradeStatus},
    Side,
};

pub(crate) fn decimal(text: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(text).map_err(|error| StoreError::Corrupt(format!("decimal {text}: {error}")))
}

pub(crate) fn decimal_opt(text: Option<String>) -> Result<Option<Decimal>, StoreError> {
    text.as_deref().map(decimal).transpose()
}

pub(crate) fn time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| StoreError::Corrupt(format!("timestamp {text}: {error}")))
}

pub(crate) fn time_sql(time: DateTime<Utc>) -> String {
    time.to_rfc3339()
}

pub(crate) fn exchange(text: &str) -> Result<ExchangeId, StoreError> {
    ExchangeId::from_str(text).map_err(|error| StoreError::Corrupt(error.to_string()))
}

pub(crate) fn side(text: &str) -> Result<Side, StoreError> {
    match text {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(StoreError::Corrupt(format!("side {other}"))),
    }
}

pub(crate) fn order_kind(text: &str) -> Result<OrderKind, StoreError> {
    match text {
        "market" => Ok(OrderKind::Market),
        "limit" => Ok(OrderKind::Limit),
        other => Err(StoreError::Corrupt(format!("order kind {other}"))),
    }
}

pub(crate) fn order_kind_sql(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Market => "market",
        OrderKind::Limit => "limit",
    }
}

pub(crate) fn status(text: &str) -> Result<TradeStatus, StoreError> {
    match text {
        "pending" => Ok(TradeStatus::Pending),
        "submitted" => Ok(TradeStatus::Submitted),
        "open" => Ok(TradeStatus::Open),
        "partial" => Ok(TradeStatus::Partial),
        "filled" => Ok(TradeStatus::Filled),
        "canceled" => Ok(TradeStatus::Canceled),
        "rejected" => Ok(TradeStatus::Rejected),
        "failed" => Ok(TradeStatus::Failed),
        other => Err(StoreError::Corrupt(format!("trade status {other}"))),
    }
}

pub(crate) fn status_sql(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Pending => "pending",
        TradeStatus::Submitted => "submitted",
        TradeStatus::Open => "open",
        TradeStatus::Partial => "partial",
        TradeStatus::Filled => "filled",
        TradeStatus::Canceled => "canceled",
        TradeStatus::Rejected => "rejected",
        TradeStatus::Failed => "failed",
    }
}
