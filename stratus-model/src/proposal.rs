use crate::{exchange::ExchangeId, instrument::Symbol, strategy::StrategyId, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker generated idempotency key for a [`Proposal`]. Becomes the client
/// order id once the proposal is approved and executed.
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
    derive_more::From,
)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A strategy's request to trade, published on
/// `request.capital.allocation.<strategy_id>`.
///
/// A proposal carries no size - position sizing is the Capital Manager's
/// decision, not the strategy's.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    /// Price observed by the strategy when the signal fired.
    pub signal_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Strategy conviction in [0, 1].
    pub confidence: f64,
    /// Opaque bag forwarded untouched to the journal.
    #[serde(default)]
    pub params: serde_json::Value,
    pub time: DateTime<Utc>,
}

impl Proposal {
    /// Absolute distance between signal price and stop-loss, if one is set.
    ///
    /// Returns `None` for a missing stop, and `Some(ZERO)` for a degenerate
    /// stop placed exactly at the signal price - callers must treat both as
    /// unusable for risk-per-unit sizing.
    pub fn stop_distance(&self) -> Option<Decimal> {
        self.stop_loss_price
            .map(|stop| (self.signal_price - stop).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn proposal(signal: Decimal, stop: Option<Decimal>) -> Proposal {
        Proposal {
            proposal_id: ProposalId::random(),
            strategy_id: StrategyId(1),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Buy,
            signal_price: signal,
            stop_loss_price: stop,
            take_profit_price: None,
            confidence: 0.9,
            params: serde_json::Value::Null,
            time: Utc::now(),
        }
    }

    #[test]
    fn test_stop_distance() {
        assert_eq!(proposal(dec!(50000), None).stop_distance(), None);
        assert_eq!(
            proposal(dec!(50000), Some(dec!(49000))).stop_distance(),
            Some(dec!(1000))
        );
        assert_eq!(
            proposal(dec!(50000), Some(dec!(50000))).stop_distance(),
            Some(Decimal::ZERO)
        );
    }
}
