#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Stratus-Model
//! Core domain types shared by every Stratus component: exchanges, symbols,
//! market data, proposals, orders, the trade journal, portfolios and the
//! error-kind taxonomy that all failures map into.
//!
//! Everything that crosses the message bus or the database lives here, so that
//! the worker, capital manager, connector and engine processes agree on one
//! vocabulary.

use serde::{Deserialize, Serialize};

/// Defines the global [`ExchangeId`](exchange::ExchangeId) enum covering all
/// supported venues.
pub mod exchange;

/// [`Symbol`](instrument::Symbol) and [`Market`](instrument::Market) types
/// identifying what is traded, and where.
pub mod instrument;

/// Normalised market data: [`Candle`](market::Candle), ticker updates, and the
/// [`MarketEvent`](market::MarketEvent) wrapper streamed over the bus.
pub mod market;

/// A strategy's [`Proposal`](proposal::Proposal) to trade - not yet an order.
pub mod proposal;

/// Order requests, exchange order identity, and the monotonic
/// [`TradeStatus`](order::TradeStatus) machine of the trade journal.
pub mod order;

/// Portfolios, portfolio rules, capital reservations and positions.
pub mod portfolio;

/// Static strategy configuration rows and position sizing models.
pub mod strategy;

/// Terminal events, alerts, heartbeats and operator commands carried on the
/// bus.
pub mod event;

/// The error-kind taxonomy every component maps its failures into.
pub mod error;

/// Side of a trade or position - Buy or Sell.
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
pub enum Side {
    #[serde(alias = "buy", alias = "BUY", alias = "b")]
    Buy,
    #[serde(alias = "sell", alias = "SELL", alias = "s")]
    Sell,
}

impl Side {
    /// Return the &str representation of this [`Side`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The opposing [`Side`].
    pub fn inverse(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign applied to quantities on this side: Buy is +1, Sell is -1.
    pub fn sign(&self) -> rust_decimal::Decimal {
        match self {
            Side::Buy => rust_decimal::Decimal::ONE,
            Side::Sell => rust_decimal::Decimal::NEGATIVE_ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_inverse() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse(), Side::Buy);
    }

    #[test]
    fn test_side_de() {
        let side = serde_json::from_str::<Side>("\"buy\"").unwrap();
        assert_eq!(side, Side::Buy);
        let side = serde_json::from_str::<Side>("\"Sell\"").unwrap();
        assert_eq!(side, Side::Sell);
    }
}
