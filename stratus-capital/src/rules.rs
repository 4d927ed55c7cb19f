use crate::Denial;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use stratus_model::{
    portfolio::{Portfolio, Position, RuleKind},
    proposal::Proposal,
    Side,
};

const PCT: Decimal = Decimal::ONE_HUNDRED;

/// Everything the rule chain may consult about the proposal's portfolio.
#[derive(Debug)]
pub struct RuleContext<'a> {
    pub portfolio: &'a Portfolio,
    /// Open positions across the portfolio's strategies.
    pub open_positions: &'a [Position],
    /// Realised PnL over the rolling 24h window.
    pub daily_realized_pnl: Decimal,
}

impl RuleContext<'_> {
    /// The position (if any) the proposal's strategy holds in its symbol.
    fn own_position(&self, proposal: &Proposal) -> Option<&Position> {
        self.open_positions.iter().find(|position| {
            position.strategy_id == proposal.strategy_id
                && position.exchange == proposal.exchange
                && position.symbol == proposal.symbol
        })
    }

    /// Whether the proposal increases portfolio exposure (opens or extends)
    /// rather than closing an existing position.
    fn increases_exposure(&self, proposal: &Proposal) -> bool {
        match self.own_position(proposal) {
            Some(position) => position.current_size.signum() == proposal.side.sign(),
            None => true,
        }
    }

    /// Current open notional across the portfolio, marked at entry prices.
    fn open_notional(&self) -> Decimal {
        self.open_positions
            .iter()
            .map(|position| position.current_size.abs() * position.entry_price)
            .sum()
    }
}

/// Rules evaluable before sizing has produced a notional. First failure wins.
pub fn check_pre_sizing(
    rules: &[RuleKind],
    context: &RuleContext<'_>,
    proposal: &Proposal,
) -> Result<(), Denial> {
    for rule in rules {
        match rule {
            RuleKind::BlockedSymbol { symbol } if *symbol == proposal.symbol => {
                return Err(Denial::new(
                    rule.name(),
                    format!("{symbol} is blocked for this portfolio"),
                ));
            }
            RuleKind::MaxDailyLossPct { pct } => {
                let threshold = -(context.portfolio.total_capital * *pct / PCT);
                // At or past the threshold: no new exposure, but closing
                // trades stay allowed.
                if context.daily_realized_pnl <= threshold
                    && context.increases_exposure(proposal)
                {
                    return Err(Denial::new(
                        rule.name(),
                        format!(
                            "daily realised PnL {} breaches {} limit",
                            context.daily_realized_pnl, threshold
                        ),
                    ));
                }
            }
            RuleKind::MaxOpenPositions { max } => {
                let open = context.open_positions.len() as u32;
                if open >= *max && context.increases_exposure(proposal) {
                    return Err(Denial::new(
                        rule.name(),
                        format!("{open} open positions at the {max} cap"),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Rules over the sized notional. First failure wins.
pub fn check_notional(
    rules: &[RuleKind],
    context: &RuleContext<'_>,
    proposal: &Proposal,
    notional: Decimal,
) -> Result<(), Denial> {
    for rule in rules {
        match rule {
            RuleKind::MaxPositionSizePct { pct } => {
                let limit = context.portfolio.total_capital * *pct / PCT;
                if notional > limit {
                    return Err(Denial::new(
                        rule.name(),
                        format!("notional {notional} exceeds {limit} ({pct}% of capital)"),
                    ));
                }
            }
            RuleKind::MaxPortfolioExposurePct { pct } => {
                if context.increases_exposure(proposal) {
                    let projected = context.open_notional() + notional;
                    let limit = context.portfolio.total_capital * *pct / PCT;
                    if projected > limit {
                        return Err(Denial::new(
                            rule.name(),
                            format!("projected exposure {projected} exceeds {limit}"),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stratus_model::{
        exchange::ExchangeId,
        instrument::Symbol,
        portfolio::PortfolioId,
        proposal::ProposalId,
        strategy::StrategyId,
    };

    fn portfolio() -> Portfolio {
        Portfolio {
            id: PortfolioId(1),
            name: "main".into(),
            parent_id: None,
            base_currency: "USDT".into(),
            total_capital: dec!(10000),
            available_capital: dec!(10000),
            is_active: true,
        }
    }

    fn proposal(side: Side) -> Proposal {
        Proposal {
            proposal_id: ProposalId::random(),
            strategy_id: StrategyId(1),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            side,
            signal_price: dec!(50000),
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: None,
            confidence: 0.8,
            params: serde_json::Value::Null,
            time: Utc::now(),
        }
    }

    fn long_position(size: Decimal) -> Position {
        let mut position =
            Position::flat(StrategyId(1), ExchangeId::Mock, Symbol::new("BTC/USDT"));
        position.apply_fill(size, dec!(50000));
        position
    }

    #[test]
    fn test_blocked_symbol_rejects() {
        let portfolio = portfolio();
        let context = RuleContext {
            portfolio: &portfolio,
            open_positions: &[],
            daily_realized_pnl: Decimal::ZERO,
        };
        let rules = [RuleKind::BlockedSymbol { symbol: Symbol::new("BTC/USDT") }];
        let denial = check_pre_sizing(&rules, &context, &proposal(Side::Buy)).unwrap_err();
        assert_eq!(denial.reason, "BLOCKED_SYMBOL");
    }

    #[test]
    fn test_max_position_size_pct_boundary() {
        let portfolio = portfolio();
        let context = RuleContext {
            portfolio: &portfolio,
            open_positions: &[],
            daily_realized_pnl: Decimal::ZERO,
        };
        let rules = [RuleKind::MaxPositionSizePct { pct: dec!(10) }];

        // Exactly 10% of 10 000 passes; a cent above fails.
        assert!(check_notional(&rules, &context, &proposal(Side::Buy), dec!(1000)).is_ok());
        let denial =
            check_notional(&rules, &context, &proposal(Side::Buy), dec!(1000.01)).unwrap_err();
        assert_eq!(denial.reason, "MAX_POSITION_SIZE_PCT");
    }

    #[test]
    fn test_daily_loss_at_threshold_rejects_opens_allows_closes() {
        let portfolio = portfolio();
        let positions = [long_position(dec!(0.1))];
        let context = RuleContext {
            portfolio: &portfolio,
            open_positions: &positions,
            // Exactly at the 2% threshold: -200 on 10 000.
            daily_realized_pnl: dec!(-200),
        };
        let rules = [RuleKind::MaxDailyLossPct { pct: dec!(2) }];

        // A buy extends the long: rejected.
        let denial = check_pre_sizing(&rules, &context, &proposal(Side::Buy)).unwrap_err();
        assert_eq!(denial.reason, "MAX_DAILY_LOSS_PCT");

        // A sell closes it: allowed.
        assert!(check_pre_sizing(&rules, &context, &proposal(Side::Sell)).is_ok());
    }

    #[test]
    fn test_portfolio_exposure_projects_new_notional() {
        let portfolio = portfolio();
        // 0.1 BTC at 50 000 entry: 5 000 already deployed.
        let positions = [long_position(dec!(0.1))];
        let context = RuleContext {
            portfolio: &portfolio,
            open_positions: &positions,
            daily_realized_pnl: Decimal::ZERO,
        };
        let rules = [RuleKind::MaxPortfolioExposurePct { pct: dec!(60) }];

        assert!(check_notional(&rules, &context, &proposal(Side::Buy), dec!(1000)).is_ok());
        let denial =
            check_notional(&rules, &context, &proposal(Side::Buy), dec!(1500)).unwrap_err();
        assert_eq!(denial.reason, "MAX_PORTFOLIO_EXPOSURE_PCT");
    }

    #[test]
    fn test_max_open_positions_caps_new_entries() {
        let portfolio = portfolio();
        let mut other =
            Position::flat(StrategyId(2), ExchangeId::Mock, Symbol::new("ETH/USDT"));
        other.apply_fill(dec!(1), dec!(2000));
        let positions = [long_position(dec!(0.1)), other];
        let context = RuleContext {
            portfolio: &portfolio,
            open_positions: &positions,
            daily_realized_pnl: Decimal::ZERO,
        };
        let rules = [RuleKind::MaxOpenPositions { max: 2 }];

        // Extending BTC long counts as exposure increase and is capped.
        let denial = check_pre_sizing(&rules, &context, &proposal(Side::Buy)).unwrap_err();
        assert_eq!(denial.reason, "MAX_OPEN_POSITIONS");
        // Closing stays allowed.
        assert!(check_pre_sizing(&rules, &context, &proposal(Side::Sell)).is_ok());
    }
}
