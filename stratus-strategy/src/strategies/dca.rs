use crate::{series::BarSeries, Indicators, Signal, Strategy, StrategyError, WorkerEvent};
use rust_decimal::Decimal;
use serde::Deserialize;
use stratus_bus::{key::keys, RoutingKey};
use stratus_model::{strategy::StrategyRecord, Side};

fn default_interval() -> String {
    "1h".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct Params {
    /// Scheduler tick interval to buy on (`1m`, `1h`, ...).
    #[serde(default = "default_interval")]
    interval: String,
    /// Optional protective stop as a fraction of the buy price, for sizing
    /// models that require one.
    #[serde(default)]
    stop_pct: Option<Decimal>,
}

/// Dollar-cost averaging: a time-driven strategy buying on every scheduler
/// tick of its configured interval, at whatever the market last printed.
///
/// Missed ticks are not caught up - a buy skipped during downtime simply
/// waits for the next boundary.
#[derive(Debug)]
pub struct Dca {
    market_subscription: RoutingKey,
    clock_subscription: RoutingKey,
    params: Params,
}

impl Dca {
    pub const TYPE: &'static str = "dca";

    pub fn new(record: &StrategyRecord) -> Result<Self, StrategyError> {
        let params: Params = serde_json::from_value(record.parameters.clone()).map_err(|error| {
            StrategyError::InvalidParameters {
                strategy_type: Self::TYPE.to_string(),
                error: error.to_string(),
            }
        })?;
        Ok(Self {
            market_subscription: keys::market_data(record.exchange, &record.symbol),
            clock_subscription: keys::clock_tick(&params.interval),
            params,
        })
    }
}

impl Strategy for Dca {
    fn required_subscriptions(&self) -> Vec<RoutingKey> {
        vec![
            self.market_subscription.clone(),
            self.clock_subscription.clone(),
        ]
    }

    fn populate_indicators(&self, _series: &BarSeries) -> Indicators {
        Indicators::default()
    }

    fn on_data(
        &mut self,
        event: &WorkerEvent<'_>,
        _series: &BarSeries,
        _indicators: &Indicators,
    ) -> Option<Signal> {
        let WorkerEvent::Clock { key, last_price, .. } = event else {
            return None;
        };
        if **key != self.clock_subscription {
            return None;
        }
        // No market data observed yet - nothing to price the buy against.
        let price = (*last_price)?;

        Some(Signal {
            side: Side::Buy,
            signal_price: price,
            stop_loss_price: self
                .params
                .stop_pct
                .map(|pct| price * (Decimal::ONE - pct)),
            take_profit_price: None,
            confidence: 1.0,
            params: serde_json::json!({ "interval": self.params.interval }),
        })
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
        strategy::{PositionSizing, StrategyId},
    };

    fn record() -> StrategyRecord {
        StrategyRecord {
            id: StrategyId(3),
            name: "dca-test".into(),
            strategy_type: Dca::TYPE.into(),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            parameters: serde_json::json!({"interval": "1h", "stop_pct": "0.05"}),
            position_sizing: Some(PositionSizing::FixedFractional {
                risk_pct: dec!(0.01),
            }),
            is_active: true,
        }
    }

    #[test]
    fn test_subscribes_to_market_and_clock() {
        let strategy = Dca::new(&record()).unwrap();
        let subscriptions = strategy.required_subscriptions();
        assert!(subscriptions.contains(&RoutingKey::new("market_data.mock.BTC/USDT")));
        assert!(subscriptions.contains(&RoutingKey::new("system.clock.tick.1h")));
    }

    #[test]
    fn test_buys_on_matching_tick_with_known_price() {
        let mut strategy = Dca::new(&record()).unwrap();
        let series = BarSeries::new(4);
        let indicators = Indicators::default();
        let key = RoutingKey::new("system.clock.tick.1h");

        // Tick before any market data: nothing to price against.
        let event = WorkerEvent::Clock {
            key: &key,
            time: Utc::now(),
            last_price: None,
        };
        assert!(strategy.on_data(&event, &series, &indicators).is_none());

        let event = WorkerEvent::Clock {
            key: &key,
            time: Utc::now(),
            last_price: Some(dec!(40000)),
        };
        let signal = strategy.on_data(&event, &series, &indicators).unwrap();
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.signal_price, dec!(40000));
        assert_eq!(signal.stop_loss_price, Some(dec!(38000)));
    }

    #[test]
    fn test_ignores_other_intervals() {
        let mut strategy = Dca::new(&record()).unwrap();
        let series = BarSeries::new(4);
        let key = RoutingKey::new("system.clock.tick.1m");
        let event = WorkerEvent::Clock {
            key: &key,
            time: Utc::now(),
            last_price: Some(dec!(40000)),
        };
        assert!(strategy
            .on_data(&event, &series, &Indicators::default())
            .is_none());
    }
}
