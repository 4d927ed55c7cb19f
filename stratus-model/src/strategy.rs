use crate::{exchange::ExchangeId, instrument::Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Primary key of a `strategies` row.
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
pub struct StrategyId(pub i64);

impl StrategyId {
    /// Pseudo-strategy carrying positions adopted by reconciliation. Created
    /// by migration; never spawned as a worker.
    pub const MANUAL: StrategyId = StrategyId(0);
}

/// Static strategy configuration, owned by the operator and mirrored by the
/// running worker. `parameters` is opaque to everything but the strategy
/// implementation itself.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub name: SmolStr,
    /// Registry tag selecting the compiled-in strategy implementation.
    pub strategy_type: SmolStr,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Sizing model for this strategy's proposals. `None` defers to the
    /// Capital Manager's configured default model.
    pub position_sizing: Option<PositionSizing>,
    pub is_active: bool,
}

/// Position sizing model dispatched by the Capital Manager.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum PositionSizing {
    /// `size = (available_capital x risk_pct) / stop_loss_distance`.
    /// A proposal without a usable stop-loss is a validation failure.
    FixedFractional { risk_pct: Decimal },
    /// FixedFractional with the stop distance replaced by `k x ATR(period)`
    /// computed over recent candles.
    VolatilityAdjusted {
        risk_pct: Decimal,
        k: Decimal,
        atr_period: usize,
    },
    /// Fractional Kelly: `f = p - (1 - p) / r` over the strategy's recent
    /// closed trades, scaled by `fraction` and capped by the global
    /// `kelly_max_fraction` safety cap.
    Kelly { fraction: Decimal, lookback: usize },
}

impl PositionSizing {
    /// Stable model tag, eg/ for logs and journal params.
    pub fn model(&self) -> &'static str {
        match self {
            PositionSizing::FixedFractional { .. } => "fixed_fractional",
            PositionSizing::VolatilityAdjusted { .. } => "volatility_adjusted",
            PositionSizing::Kelly { .. } => "kelly",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_sizing_serde_tag() {
        let sizing = PositionSizing::FixedFractional { risk_pct: dec!(0.02) };
        let json = serde_json::to_value(&sizing).unwrap();
        assert_eq!(json["model"], "fixed_fractional");
        assert_eq!(
            serde_json::from_value::<PositionSizing>(json).unwrap(),
            sizing
        );
    }
}
