use crate::{
    indicators::rsi, series::BarSeries, Indicators, Signal, Strategy, StrategyError, WorkerEvent,
};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use stratus_bus::{key::keys, RoutingKey};
use stratus_model::{strategy::StrategyRecord, Side};

fn default_period() -> usize {
    14
}
fn default_oversold() -> Decimal {
    Decimal::from(30)
}
fn default_overbought() -> Decimal {
    Decimal::from(70)
}
fn default_stop_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

#[derive(Debug, Clone, Deserialize)]
struct Params {
    #[serde(default = "default_period")]
    period: usize,
    #[serde(default = "default_oversold")]
    oversold: Decimal,
    #[serde(default = "default_overbought")]
    overbought: Decimal,
    #[serde(default = "default_stop_pct")]
    stop_pct: Decimal,
}

/// Mean reversion on RSI extremes: buy oversold, sell overbought.
///
/// Re-arms only after RSI has left the extreme zone, so a market pinned at an
/// extreme produces one signal, not one per bar.
#[derive(Debug)]
pub struct RsiReversion {
    subscription: RoutingKey,
    params: Params,
    state: State,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
struct State {
    /// Set while RSI sits inside an extreme zone we already signalled on.
    in_zone: Option<Side>,
}

impl RsiReversion {
    pub const TYPE: &'static str = "rsi_reversion";

    pub fn new(record: &StrategyRecord) -> Result<Self, StrategyError> {
        let params: Params = serde_json::from_value(record.parameters.clone()).map_err(|error| {
            StrategyError::InvalidParameters {
                strategy_type: Self::TYPE.to_string(),
                error: error.to_string(),
            }
        })?;
        if params.oversold >= params.overbought {
            return Err(StrategyError::InvalidParameters {
                strategy_type: Self::TYPE.to_string(),
                error: format!(
                    "oversold {} must be below overbought {}",
                    params.oversold, params.overbought
                ),
            });
        }
        Ok(Self {
            subscription: keys::market_data(record.exchange, &record.symbol),
            params,
            state: State::default(),
        })
    }
}

impl Strategy for RsiReversion {
    fn required_subscriptions(&self) -> Vec<RoutingKey> {
        vec![self.subscription.clone()]
    }

    fn populate_indicators(&self, series: &BarSeries) -> Indicators {
        let mut indicators = Indicators::default();
        if let Some(rsi) = rsi(&series.closes(), self.params.period) {
            indicators.insert("rsi", rsi);
        }
        indicators
    }

    fn on_data(
        &mut self,
        event: &WorkerEvent<'_>,
        _series: &BarSeries,
        indicators: &Indicators,
    ) -> Option<Signal> {
        let WorkerEvent::Market(market) = event else {
            return None;
        };
        let candle = market.closed_candle()?;
        let rsi = indicators.get("rsi")?;

        let side = if rsi <= self.params.oversold {
            Side::Buy
        } else if rsi >= self.params.overbought {
            Side::Sell
        } else {
            self.state.in_zone = None;
            return None;
        };

        if self.state.in_zone == Some(side) {
            return None;
        }
        self.state.in_zone = Some(side);

        let price = candle.close;
        let stop_loss_price = match side {
            Side::Buy => price * (Decimal::ONE - self.params.stop_pct),
            Side::Sell => price * (Decimal::ONE + self.params.stop_pct),
        };
        // Deeper extremes carry more conviction.
        let depth = match side {
            Side::Buy => self.params.oversold - rsi,
            Side::Sell => rsi - self.params.overbought,
        };
        let confidence = (0.5 + depth.to_f64().unwrap_or(0.0) / 100.0).min(1.0);

        Some(Signal {
            side,
            signal_price: price,
            stop_loss_price: Some(stop_loss_price),
            take_profit_price: None,
            confidence,
            params: serde_json::json!({ "rsi": rsi }),
        })
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn restore(&mut self, snapshot: serde_json::Value) {
        if let Ok(state) = serde_json::from_value(snapshot) {
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stratus_model::{
        exchange::ExchangeId,
        instrument::Symbol,
        market::{Candle, CandlePeriod, MarketDataKind, MarketEvent},
        strategy::{PositionSizing, StrategyId},
    };

    fn record() -> StrategyRecord {
        StrategyRecord {
            id: StrategyId(2),
            name: "rsi-test".into(),
            strategy_type: RsiReversion::TYPE.into(),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("ETH/USDT"),
            parameters: serde_json::json!({"period": 3}),
            position_sizing: Some(PositionSizing::FixedFractional {
                risk_pct: dec!(0.01),
            }),
            is_active: true,
        }
    }

    fn run(strategy: &mut RsiReversion, closes: &[i64]) -> Vec<Side> {
        let mut series = BarSeries::new(64);
        let mut sides = Vec::new();
        for close in closes {
            let close = Decimal::from(*close);
            let candle = Candle {
                period: CandlePeriod::Minute1,
                open_time: Utc::now(),
                close_time: Utc::now(),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1),
                closed: true,
            };
            series.push(candle.clone());
            let indicators = strategy.populate_indicators(&series);
            let event = MarketEvent::new(
                ExchangeId::Mock,
                Symbol::new("ETH/USDT"),
                Utc::now(),
                Utc::now(),
                MarketDataKind::Candle(candle),
            );
            if let Some(signal) =
                strategy.on_data(&WorkerEvent::Market(&event), &series, &indicators)
            {
                sides.push(signal.side);
            }
        }
        sides
    }

    #[test]
    fn test_signals_once_per_extreme() {
        let mut strategy = RsiReversion::new(&record()).unwrap();
        // Monotonic fall pins RSI at 0: exactly one buy despite many bars.
        let sides = run(&mut strategy, &[100, 95, 90, 85, 80, 75, 70]);
        assert_eq!(sides, vec![Side::Buy]);
    }

    #[test]
    fn test_overbought_sells() {
        let mut strategy = RsiReversion::new(&record()).unwrap();
        let sides = run(&mut strategy, &[10, 12, 14, 16, 18, 20]);
        assert_eq!(sides, vec![Side::Sell]);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut record = record();
        record.parameters = serde_json::json!({"oversold": 80, "overbought": 20});
        assert!(RsiReversion::new(&record).is_err());
    }
}
