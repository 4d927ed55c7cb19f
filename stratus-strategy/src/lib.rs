#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Stratus-Strategy
//! The strategy contract and the isolated worker runtime executing it.
//!
//! A strategy is pure decision logic: it consumes normalised market data (and
//! optionally scheduler clock ticks), computes indicators deterministically on
//! bar close, and emits at most one [`Signal`] per update. It never sizes, it
//! never orders - those are the Capital Manager's and the connector's jobs.
//!
//! Strategies ship compiled-in and are selected by the `strategy_type` tag of
//! their configuration row via [`registry::build`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratus_bus::RoutingKey;
use stratus_model::{market::MarketEvent, Side};

/// Bounded ring buffer of the most recent closed bars.
pub mod series;

/// Indicator math: SMA, EMA, RSI (Wilder), ATR.
pub mod indicators;

/// Static registry mapping `strategy_type` tags to implementations.
pub mod registry;

/// Built-in strategies.
pub mod strategies;

/// The per-strategy worker event loop.
pub mod worker;

use series::BarSeries;

/// Named indicator values computed by [`Strategy::populate_indicators`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Indicators {
    values: fnv::FnvHashMap<smol_str::SmolStr, Decimal>,
}

impl Indicators {
    pub fn insert(&mut self, name: &str, value: Decimal) {
        self.values.insert(smol_str::SmolStr::new(name), value);
    }

    pub fn get(&self, name: &str) -> Option<Decimal> {
        self.values.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An update delivered to [`Strategy::on_data`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent<'a> {
    /// A market data frame for one of the strategy's subscriptions.
    Market(&'a MarketEvent),
    /// A scheduler tick, for time-driven strategies. Carries the most recent
    /// price the worker has observed, if any.
    Clock {
        key: &'a RoutingKey,
        time: DateTime<Utc>,
        last_price: Option<Decimal>,
    },
}

/// A strategy's advisory output: the trade it wants, minus identity and
/// sizing. The worker stamps it into a
/// [`Proposal`](stratus_model::proposal::Proposal).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Signal {
    pub side: Side,
    pub signal_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Conviction in [0, 1].
    pub confidence: f64,
    /// Opaque bag journaled with the proposal.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Trait implemented by every tradeable strategy.
///
/// Implementations must be deterministic in their inputs:
/// `populate_indicators` is pure, and a restored strategy replaying the same
/// market data must produce the same signals as an uninterrupted run.
pub trait Strategy: Send {
    /// The routing keys this strategy consumes, declared at construction.
    /// The worker subscribes to exactly these.
    fn required_subscriptions(&self) -> Vec<RoutingKey>;

    /// Compute indicator values over the closed-bar history. Executed when a
    /// new bar closes, before `on_data`. Pure and synchronous.
    fn populate_indicators(&self, series: &BarSeries) -> Indicators;

    /// Handle one update; return at most one [`Signal`] or nothing.
    fn on_data(
        &mut self,
        event: &WorkerEvent<'_>,
        series: &BarSeries,
        indicators: &Indicators,
    ) -> Option<Signal>;

    /// Called once before the strategy begins processing events.
    fn on_start(&mut self) {}

    /// Called when the strategy is shutting down.
    fn on_stop(&mut self) {}

    /// Serializable internal state for warm restart. `None` for stateless
    /// strategies.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore internal state captured by [`Strategy::snapshot`].
    fn restore(&mut self, _snapshot: serde_json::Value) {}
}

/// All errors produced while building or running a strategy.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("unknown strategy_type: {0}")]
    UnknownType(String),

    #[error("invalid parameters for {strategy_type}: {error}")]
    InvalidParameters {
        strategy_type: String,
        error: String,
    },

    #[error("bus error: {0}")]
    Bus(#[from] stratus_bus::error::BusError),

    #[error("store error: {0}")]
    Store(#[from] stratus_store::error::StoreError),
}
