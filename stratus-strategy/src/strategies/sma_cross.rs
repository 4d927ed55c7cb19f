use crate::{
    indicators::sma, series::BarSeries, Indicators, Signal, Strategy, StrategyError, WorkerEvent,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stratus_bus::{key::keys, RoutingKey};
use stratus_model::{strategy::StrategyRecord, Side};

fn default_fast() -> usize {
    9
}
fn default_slow() -> usize {
    21
}
fn default_stop_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

#[derive(Debug, Clone, Deserialize)]
struct Params {
    #[serde(default = "default_fast")]
    fast: usize,
    #[serde(default = "default_slow")]
    slow: usize,
    /// Stop-loss distance as a fraction of the signal price.
    #[serde(default = "default_stop_pct")]
    stop_pct: Decimal,
}

/// Fast/slow moving-average crossover.
///
/// Emits a buy when the fast SMA crosses above the slow, a sell when it
/// crosses back below. Only acts on closed bars.
#[derive(Debug)]
pub struct SmaCross {
    subscription: RoutingKey,
    params: Params,
    state: State,
}

/// Which side of the slow SMA the fast SMA was on at the previous bar close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
enum Relation {
    Above,
    Below,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
struct State {
    last_relation: Option<Relation>,
}

impl SmaCross {
    pub const TYPE: &'static str = "sma_cross";

    pub fn new(record: &StrategyRecord) -> Result<Self, StrategyError> {
        let params: Params = serde_json::from_value(record.parameters.clone()).map_err(|error| {
            StrategyError::InvalidParameters {
                strategy_type: Self::TYPE.to_string(),
                error: error.to_string(),
            }
        })?;
        if params.fast == 0 || params.fast >= params.slow {
            return Err(StrategyError::InvalidParameters {
                strategy_type: Self::TYPE.to_string(),
                error: format!("fast {} must be below slow {}", params.fast, params.slow),
            });
        }
        Ok(Self {
            subscription: keys::market_data(record.exchange, &record.symbol),
            params,
            state: State::default(),
        })
    }
}

impl Strategy for SmaCross {
    fn required_subscriptions(&self) -> Vec<RoutingKey> {
        vec![self.subscription.clone()]
    }

    fn populate_indicators(&self, series: &BarSeries) -> Indicators {
        let mut indicators = Indicators::default();
        let closes = series.closes();
        if let Some(fast) = sma(&closes, self.params.fast) {
            indicators.insert("sma_fast", fast);
        }
        if let Some(slow) = sma(&closes, self.params.slow) {
            indicators.insert("sma_slow", slow);
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
        let fast = indicators.get("sma_fast")?;
        let slow = indicators.get("sma_slow")?;

        let relation = if fast > slow {
            Relation::Above
        } else {
            Relation::Below
        };
        let previous = self.state.last_relation.replace(relation);

        let side = match (previous, relation) {
            (Some(Relation::Below), Relation::Above) => Side::Buy,
            (Some(Relation::Above), Relation::Below) => Side::Sell,
            _ => return None,
        };

        let price = candle.close;
        let stop_loss_price = match side {
            Side::Buy => price * (Decimal::ONE - self.params.stop_pct),
            Side::Sell => price * (Decimal::ONE + self.params.stop_pct),
        };

        Some(Signal {
            side,
            signal_price: price,
            stop_loss_price: Some(stop_loss_price),
            take_profit_price: None,
            confidence: 0.7,
            params: serde_json::json!({ "sma_fast": fast, "sma_slow": slow }),
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

    fn record(params: serde_json::Value) -> StrategyRecord {
        StrategyRecord {
            id: StrategyId(1),
            name: "sma-test".into(),
            strategy_type: SmaCross::TYPE.into(),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            parameters: params,
            position_sizing: Some(PositionSizing::FixedFractional {
                risk_pct: dec!(0.01),
            }),
            is_active: true,
        }
    }

    fn closed_bar(close: Decimal) -> Candle {
        Candle {
            period: CandlePeriod::Minute1,
            open_time: Utc::now(),
            close_time: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    fn market_event(candle: Candle) -> MarketEvent {
        MarketEvent::new(
            ExchangeId::Mock,
            Symbol::new("BTC/USDT"),
            Utc::now(),
            Utc::now(),
            MarketDataKind::Candle(candle),
        )
    }

    /// Drive the strategy with a close series and collect emitted sides.
    fn run(strategy: &mut SmaCross, closes: &[i64]) -> Vec<Side> {
        let mut series = BarSeries::new(64);
        let mut sides = Vec::new();
        for close in closes {
            let candle = closed_bar(Decimal::from(*close));
            series.push(candle.clone());
            let indicators = strategy.populate_indicators(&series);
            let event = market_event(candle);
            if let Some(signal) =
                strategy.on_data(&WorkerEvent::Market(&event), &series, &indicators)
            {
                sides.push(signal.side);
            }
        }
        sides
    }

    #[test]
    fn test_rejects_degenerate_windows() {
        assert!(SmaCross::new(&record(serde_json::json!({"fast": 5, "slow": 5}))).is_err());
        assert!(SmaCross::new(&record(serde_json::json!({"fast": 0}))).is_err());
    }

    #[test]
    fn test_emits_buy_then_sell_on_crossover() {
        let mut strategy =
            SmaCross::new(&record(serde_json::json!({"fast": 2, "slow": 4}))).unwrap();

        // Flat, then rally (fast crosses above), then slump (crosses below).
        let sides = run(
            &mut strategy,
            &[10, 10, 10, 10, 10, 14, 18, 22, 26, 10, 6, 4, 2],
        );
        assert_eq!(sides, vec![Side::Buy, Side::Sell]);
    }

    #[test]
    fn test_restore_suppresses_duplicate_signal() {
        let record = record(serde_json::json!({"fast": 2, "slow": 4}));
        let closes = [10, 10, 10, 10, 10, 14, 18, 22];

        let mut uninterrupted = SmaCross::new(&record).unwrap();
        let all = run(&mut uninterrupted, &closes);
        assert_eq!(all, vec![Side::Buy]);

        // Restart after the crossover: the restored state remembers the fast
        // SMA is already above, so no duplicate buy fires.
        let snapshot = uninterrupted.snapshot().unwrap();
        let mut restored = SmaCross::new(&record).unwrap();
        restored.restore(snapshot);
        let more = run(&mut restored, &[26, 30, 34, 38, 42]);
        assert!(more.is_empty());
    }
}
