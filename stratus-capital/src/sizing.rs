use crate::Denial;
use rust_decimal::Decimal;
use stratus_model::{
    order::TradeRecord, portfolio::Portfolio, proposal::Proposal, strategy::PositionSizing,
};

/// Reason code for sizing refusals that are not rule violations.
pub const REASON_VALIDATION: &str = "validation_failed";

/// Base-asset precision orders are rounded to.
const SIZE_DECIMALS: u32 = 8;

/// Inputs the sizing dispatch may draw on.
#[derive(Debug)]
pub struct SizingInputs<'a> {
    pub proposal: &'a Proposal,
    pub portfolio: &'a Portfolio,
    pub sizing: &'a PositionSizing,
    /// ATR over recent candles, when the manager has enough history.
    pub atr: Option<Decimal>,
    /// The strategy's recent terminally-filled trades, newest first.
    pub recent_trades: &'a [TradeRecord],
    /// Global safety cap for Kelly sizing.
    pub kelly_max_fraction: Decimal,
    /// Minimum closed-trade history before Kelly has an estimate at all.
    pub kelly_min_trades: usize,
}

/// Compute the base-asset order size for an approved proposal.
///
/// Every failure is a refusal value, never a panic: a zero stop distance is a
/// `validation_failed` denial, not a division by zero.
pub fn size(inputs: &SizingInputs<'_>) -> Result<Decimal, Denial> {
    let amount = match inputs.sizing {
        PositionSizing::FixedFractional { risk_pct } => {
            let distance = stop_distance(inputs.proposal)?;
            risk_budget(inputs.portfolio, *risk_pct)? / distance
        }
        PositionSizing::VolatilityAdjusted { risk_pct, k, atr_period } => {
            let atr = inputs.atr.ok_or_else(|| {
                Denial::new(
                    REASON_VALIDATION,
                    format!("insufficient candle history for ATR({atr_period})"),
                )
            })?;
            let distance = *k * atr;
            if distance <= Decimal::ZERO {
                return Err(Denial::new(
                    REASON_VALIDATION,
                    "volatility-adjusted stop distance is zero",
                ));
            }
            risk_budget(inputs.portfolio, *risk_pct)? / distance
        }
        PositionSizing::Kelly { fraction, lookback } => {
            kelly_amount(inputs, *fraction, *lookback)?
        }
    };

    let amount = amount.round_dp(SIZE_DECIMALS);
    if amount <= Decimal::ZERO {
        return Err(Denial::new(REASON_VALIDATION, "sized amount is zero"));
    }
    Ok(amount)
}

fn stop_distance(proposal: &Proposal) -> Result<Decimal, Denial> {
    match proposal.stop_distance() {
        Some(distance) if distance > Decimal::ZERO => Ok(distance),
        Some(_) => Err(Denial::new(
            REASON_VALIDATION,
            "stop-loss distance is zero",
        )),
        None => Err(Denial::new(
            REASON_VALIDATION,
            "sizing model requires a stop-loss price",
        )),
    }
}

fn risk_budget(portfolio: &Portfolio, risk_pct: Decimal) -> Result<Decimal, Denial> {
    if risk_pct <= Decimal::ZERO {
        return Err(Denial::new(REASON_VALIDATION, "non-positive risk_pct"));
    }
    Ok(portfolio.available_capital * risk_pct)
}

/// Fractional Kelly over the strategy's recent closed trades:
/// `f = p - (1 - p) / r`, scaled by `fraction`, capped by the global safety
/// fraction, floored at zero.
fn kelly_amount(
    inputs: &SizingInputs<'_>,
    fraction: Decimal,
    lookback: usize,
) -> Result<Decimal, Denial> {
    let outcomes: Vec<Decimal> = inputs
        .recent_trades
        .iter()
        .take(lookback)
        .filter_map(|trade| trade.realized_pnl)
        .filter(|pnl| !pnl.is_zero())
        .collect();

    if outcomes.len() < inputs.kelly_min_trades {
        return Err(Denial::new(
            REASON_VALIDATION,
            format!(
                "kelly needs {} closed trades, found {}",
                inputs.kelly_min_trades,
                outcomes.len()
            ),
        ));
    }

    let wins: Vec<Decimal> = outcomes.iter().copied().filter(|pnl| *pnl > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = outcomes.iter().copied().filter(|pnl| *pnl < Decimal::ZERO).collect();
    if wins.is_empty() || losses.is_empty() {
        return Err(Denial::new(
            REASON_VALIDATION,
            "kelly needs both winning and losing trades to estimate an edge",
        ));
    }

    let count = Decimal::from(outcomes.len() as u64);
    let p = Decimal::from(wins.len() as u64) / count;
    let avg_win: Decimal =
        wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u64);
    let avg_loss: Decimal =
        -losses.iter().copied().sum::<Decimal>() / Decimal::from(losses.len() as u64);
    let r = avg_win / avg_loss;

    let f = p - (Decimal::ONE - p) / r;
    let f = (fraction * f).min(inputs.kelly_max_fraction).max(Decimal::ZERO);
    if f.is_zero() {
        return Err(Denial::new(REASON_VALIDATION, "kelly edge is not positive"));
    }

    let notional = f * inputs.portfolio.available_capital;
    Ok(notional / inputs.proposal.signal_price)
}

/// Quote notional a sized order will reserve, at the proposal's signal price.
pub fn notional(proposal: &Proposal, amount: Decimal) -> Decimal {
    (amount * proposal.signal_price).round_dp(SIZE_DECIMALS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stratus_model::{
        exchange::ExchangeId,
        instrument::Symbol,
        order::{ClientOrderId, OrderKind, TradeId, TradeStatus},
        portfolio::PortfolioId,
        proposal::ProposalId,
        strategy::StrategyId,
        Side,
    };

    fn portfolio(available: Decimal) -> Portfolio {
        Portfolio {
            id: PortfolioId(1),
            name: "main".into(),
            parent_id: None,
            base_currency: "USDT".into(),
            total_capital: dec!(10000),
            available_capital: available,
            is_active: true,
        }
    }

    fn proposal(stop: Option<Decimal>) -> Proposal {
        Proposal {
            proposal_id: ProposalId::random(),
            strategy_id: StrategyId(1),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Buy,
            signal_price: dec!(50000),
            stop_loss_price: stop,
            take_profit_price: None,
            confidence: 0.8,
            params: serde_json::Value::Null,
            time: Utc::now(),
        }
    }

    fn inputs<'a>(
        proposal: &'a Proposal,
        portfolio: &'a Portfolio,
        sizing: &'a PositionSizing,
        trades: &'a [TradeRecord],
    ) -> SizingInputs<'a> {
        SizingInputs {
            proposal,
            portfolio,
            sizing,
            atr: None,
            recent_trades: trades,
            kelly_max_fraction: dec!(0.2),
            kelly_min_trades: 5,
        }
    }

    #[test]
    fn test_fixed_fractional_spec_example() {
        // available 10 000, risk 2%, stop distance 1 000: size 0.2 BTC.
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(Some(dec!(49000)));
        let sizing = PositionSizing::FixedFractional { risk_pct: dec!(0.02) };
        let amount = size(&inputs(&proposal, &portfolio, &sizing, &[])).unwrap();
        assert_eq!(amount, dec!(0.2));
        assert_eq!(notional(&proposal, amount), dec!(10000));
    }

    #[test]
    fn test_fixed_fractional_within_limits() {
        // risk 0.2%: size 0.02 BTC, notional 1 000.
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(Some(dec!(49000)));
        let sizing = PositionSizing::FixedFractional { risk_pct: dec!(0.002) };
        let amount = size(&inputs(&proposal, &portfolio, &sizing, &[])).unwrap();
        assert_eq!(amount, dec!(0.02));
        assert_eq!(notional(&proposal, amount), dec!(1000));
    }

    #[test]
    fn test_zero_stop_distance_is_denial_not_crash() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(Some(dec!(50000)));
        let sizing = PositionSizing::FixedFractional { risk_pct: dec!(0.02) };
        let denial = size(&inputs(&proposal, &portfolio, &sizing, &[])).unwrap_err();
        assert_eq!(denial.reason, REASON_VALIDATION);
        assert!(denial.detail.contains("zero"));
    }

    #[test]
    fn test_missing_stop_is_denial() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(None);
        let sizing = PositionSizing::FixedFractional { risk_pct: dec!(0.02) };
        assert!(size(&inputs(&proposal, &portfolio, &sizing, &[])).is_err());
    }

    #[test]
    fn test_volatility_adjusted_uses_atr() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(None);
        let sizing = PositionSizing::VolatilityAdjusted {
            risk_pct: dec!(0.02),
            k: dec!(2),
            atr_period: 14,
        };
        let mut sizing_inputs = inputs(&proposal, &portfolio, &sizing, &[]);

        // No ATR yet: refused.
        assert!(size(&sizing_inputs).is_err());

        // ATR 500, k 2: distance 1 000 - same as the fixed example.
        sizing_inputs.atr = Some(dec!(500));
        assert_eq!(size(&sizing_inputs).unwrap(), dec!(0.2));
    }

    fn closed_trade(pnl: Decimal) -> TradeRecord {
        TradeRecord {
            id: TradeId(1),
            strategy_id: StrategyId(1),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            exchange_order_id: None,
            client_order_id: ClientOrderId::new("x"),
            reservation_id: None,
            kind: OrderKind::Market,
            side: Side::Buy,
            amount: dec!(1),
            price: None,
            filled_amount: dec!(1),
            avg_fill_price: Some(dec!(100)),
            fee: None,
            realized_pnl: Some(pnl),
            status: TradeStatus::Filled,
            settled_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_kelly_caps_at_safety_fraction() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(None);
        let sizing = PositionSizing::Kelly { fraction: dec!(1), lookback: 20 };
        // 4 wins of 100, 2 losses of 50: p = 2/3, r = 2, f = 1/2.
        let trades: Vec<TradeRecord> = [100, 100, 100, 100, -50, -50]
            .into_iter()
            .map(|pnl| closed_trade(Decimal::from(pnl)))
            .collect();
        let sizing_inputs = inputs(&proposal, &portfolio, &sizing, &trades);

        // Uncapped f would be 0.5; the 0.2 safety cap wins: 2 000 notional.
        let amount = size(&sizing_inputs).unwrap();
        assert_eq!(notional(&proposal, amount), dec!(2000));
    }

    #[test]
    fn test_kelly_refuses_thin_history() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(None);
        let sizing = PositionSizing::Kelly { fraction: dec!(0.5), lookback: 20 };
        let trades = vec![closed_trade(dec!(100))];
        assert!(size(&inputs(&proposal, &portfolio, &sizing, &trades)).is_err());
    }

    #[test]
    fn test_kelly_negative_edge_refused() {
        let portfolio = portfolio(dec!(10000));
        let proposal = proposal(None);
        let sizing = PositionSizing::Kelly { fraction: dec!(0.5), lookback: 20 };
        // 1 win of 50, 5 losses of 100: clearly negative edge.
        let trades: Vec<TradeRecord> = [50, -100, -100, -100, -100, -100]
            .into_iter()
            .map(|pnl| closed_trade(Decimal::from(pnl)))
            .collect();
        let denial = size(&inputs(&proposal, &portfolio, &sizing, &trades)).unwrap_err();
        assert!(denial.detail.contains("edge"));
    }
}
