use crate::{exchange::ExchangeId, instrument::Symbol, strategy::StrategyId};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Primary key of a `portfolios` row.
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
pub struct PortfolioId(pub i64);

/// Primary key of a capital `reservations` row.
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
pub struct ReservationId(pub i64);

/// A pool of capital, optionally nested under a parent pool.
///
/// Ledger invariant: `0 <= available_capital <= total_capital`, and for every
/// portfolio `available_capital + sum(open reservations) == total_capital`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Portfolio {
    pub id: PortfolioId,
    pub name: SmolStr,
    pub parent_id: Option<PortfolioId>,
    pub base_currency: SmolStr,
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub is_active: bool,
}

impl Portfolio {
    /// Capital currently earmarked by open reservations.
    pub fn reserved_capital(&self) -> Decimal {
        self.total_capital - self.available_capital
    }
}

/// Capital earmarked for an in-flight approved proposal. Released or settled
/// on the terminal trade event, or by reconciliation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub portfolio_id: PortfolioId,
    pub strategy_id: StrategyId,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A policy attached to a portfolio. The active ruleset is the intersection of
/// all attached rules - a proposal must satisfy every one.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PortfolioRule {
    pub portfolio_id: PortfolioId,
    pub rule: RuleKind,
}

/// Rule taxonomy, with each variant carrying its structured payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "rule_type", content = "rule_value")]
pub enum RuleKind {
    /// Reject proposals for the listed symbol outright.
    #[serde(rename = "BLOCKED_SYMBOL")]
    BlockedSymbol { symbol: Symbol },
    /// Proposed notional must be <= pct x total_capital.
    #[serde(rename = "MAX_POSITION_SIZE_PCT")]
    MaxPositionSizePct { pct: Decimal },
    /// Projected open notional / total_capital must be <= pct.
    #[serde(rename = "MAX_PORTFOLIO_EXPOSURE_PCT")]
    MaxPortfolioExposurePct { pct: Decimal },
    /// Reject exposure-increasing proposals once realized PnL over the rolling
    /// 24h window is at or below -pct x total_capital. Closing trades pass.
    #[serde(rename = "MAX_DAILY_LOSS_PCT")]
    MaxDailyLossPct { pct: Decimal },
    /// Cap the number of simultaneously open positions in the portfolio.
    #[serde(rename = "MAX_OPEN_POSITIONS")]
    MaxOpenPositions { max: u32 },
}

impl RuleKind {
    /// Stable rule name used as the denial reason code.
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::BlockedSymbol { .. } => "BLOCKED_SYMBOL",
            RuleKind::MaxPositionSizePct { .. } => "MAX_POSITION_SIZE_PCT",
            RuleKind::MaxPortfolioExposurePct { .. } => "MAX_PORTFOLIO_EXPOSURE_PCT",
            RuleKind::MaxDailyLossPct { .. } => "MAX_DAILY_LOSS_PCT",
            RuleKind::MaxOpenPositions { .. } => "MAX_OPEN_POSITIONS",
        }
    }
}

/// Mutable view of current holdings per (strategy, exchange, symbol).
///
/// A derived cache over the trade journal: `current_size` must always equal
/// the sum of signed fills attributable to the key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    /// Average entry price of the open quantity.
    pub entry_price: Decimal,
    /// Signed size: long positive, short negative.
    pub current_size: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub is_open: bool,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A flat position for the given key.
    pub fn flat(strategy_id: StrategyId, exchange: ExchangeId, symbol: Symbol) -> Self {
        Self {
            strategy_id,
            exchange,
            symbol,
            entry_price: Decimal::ZERO,
            current_size: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            is_open: false,
            updated_at: Utc::now(),
        }
    }

    /// Quote notional of the open quantity at the given mark price.
    pub fn notional(&self, mark_price: Decimal) -> Decimal {
        self.current_size.abs() * mark_price
    }

    /// Apply a signed fill to this position, returning the realised PnL of any
    /// reduced quantity.
    ///
    /// Increasing the position re-averages the entry price; reducing realises
    /// PnL against it. A fill through zero flips the position and the
    /// remainder opens at the fill price.
    pub fn apply_fill(&mut self, signed_amount: Decimal, price: Decimal) -> Decimal {
        if signed_amount.is_zero() {
            return Decimal::ZERO;
        }

        let realized = if self.current_size.is_zero()
            || self.current_size.signum() == signed_amount.signum()
        {
            // Opening or increasing: weighted average entry.
            let new_size = self.current_size + signed_amount;
            self.entry_price = (self.entry_price * self.current_size.abs()
                + price * signed_amount.abs())
                / new_size.abs();
            self.current_size = new_size;
            Decimal::ZERO
        } else {
            let reduce = signed_amount.abs().min(self.current_size.abs());
            // Long reduced by sell profits when price > entry; short inverted.
            let realized = (price - self.entry_price) * reduce * self.current_size.signum();
            let remainder = signed_amount.abs() - reduce;
            self.current_size += signed_amount;
            if remainder > Decimal::ZERO {
                // Flipped through zero: remainder opens at the fill price.
                self.entry_price = price;
            } else if self.current_size.is_zero() {
                self.entry_price = Decimal::ZERO;
            }
            realized
        };

        self.realized_pnl += realized;
        self.is_open = !self.current_size.is_zero();
        if !self.is_open {
            self.unrealized_pnl = Decimal::ZERO;
        }
        self.updated_at = Utc::now();
        realized
    }

    /// Re-mark unrealised PnL at the given price.
    pub fn update_unrealized(&mut self, mark_price: Decimal) {
        self.unrealized_pnl = (mark_price - self.entry_price) * self.current_size;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::flat(StrategyId(1), ExchangeId::Mock, Symbol::new("BTC/USDT"))
    }

    #[test]
    fn test_apply_fill_opens_long() {
        let mut position = position();
        let realized = position.apply_fill(dec!(0.02), dec!(50010));
        assert_eq!(realized, Decimal::ZERO);
        assert_eq!(position.current_size, dec!(0.02));
        assert_eq!(position.entry_price, dec!(50010));
        assert!(position.is_open);
    }

    #[test]
    fn test_apply_fill_averages_entry() {
        let mut position = position();
        position.apply_fill(dec!(1), dec!(100));
        position.apply_fill(dec!(1), dec!(200));
        assert_eq!(position.entry_price, dec!(150));
        assert_eq!(position.current_size, dec!(2));
    }

    #[test]
    fn test_apply_fill_realises_pnl_on_reduce() {
        let mut position = position();
        position.apply_fill(dec!(2), dec!(100));
        let realized = position.apply_fill(dec!(-1), dec!(110));
        assert_eq!(realized, dec!(10));
        assert_eq!(position.current_size, dec!(1));
        assert_eq!(position.entry_price, dec!(100));
    }

    #[test]
    fn test_apply_fill_closes_to_flat() {
        let mut position = position();
        position.apply_fill(dec!(1), dec!(100));
        let realized = position.apply_fill(dec!(-1), dec!(90));
        assert_eq!(realized, dec!(-10));
        assert!(!position.is_open);
        assert_eq!(position.entry_price, Decimal::ZERO);
        assert_eq!(position.unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_apply_fill_flips_through_zero() {
        let mut position = position();
        position.apply_fill(dec!(1), dec!(100));
        let realized = position.apply_fill(dec!(-3), dec!(120));
        assert_eq!(realized, dec!(20));
        assert_eq!(position.current_size, dec!(-2));
        assert_eq!(position.entry_price, dec!(120));
    }

    #[test]
    fn test_short_position_pnl() {
        let mut position = position();
        position.apply_fill(dec!(-1), dec!(100));
        position.update_unrealized(dec!(90));
        assert_eq!(position.unrealized_pnl, dec!(10));
        let realized = position.apply_fill(dec!(1), dec!(90));
        assert_eq!(realized, dec!(10));
        assert!(!position.is_open);
    }

    #[test]
    fn test_rule_kind_serde_tag() {
        let rule = RuleKind::MaxPositionSizePct { pct: dec!(10) };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["rule_type"], "MAX_POSITION_SIZE_PCT");
        assert_eq!(serde_json::from_value::<RuleKind>(json).unwrap(), rule);
    }
}
