use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stratus_bus::{key::keys, publish_json, MessageBus};
use stratus_model::market::CandlePeriod;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Payload of a `system.clock.tick.<interval>` message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClockTick {
    pub interval: String,
    pub time: DateTime<Utc>,
}

fn timer(period: CandlePeriod) -> tokio::time::Interval {
    let duration = period
        .duration()
        .to_std()
        .expect("candle periods are positive");
    let mut timer = tokio::time::interval(duration);
    // No catch-up for missed ticks: a buy skipped during downtime waits for
    // the next boundary.
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer
}

/// Publish wall-clock ticks for time-driven strategies, one routing key per
/// supported interval. Ticks are best-effort (MarketData class).
pub fn spawn_scheduler(bus: Arc<dyn MessageBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut minute_1 = timer(CandlePeriod::Minute1);
        let mut minute_5 = timer(CandlePeriod::Minute5);
        let mut minute_15 = timer(CandlePeriod::Minute15);
        let mut hour_1 = timer(CandlePeriod::Hour1);
        let mut hour_4 = timer(CandlePeriod::Hour4);
        let mut day_1 = timer(CandlePeriod::Day1);

        loop {
            let period = tokio::select! {
                _ = minute_1.tick() => CandlePeriod::Minute1,
                _ = minute_5.tick() => CandlePeriod::Minute5,
                _ = minute_15.tick() => CandlePeriod::Minute15,
                _ = hour_1.tick() => CandlePeriod::Hour1,
                _ = hour_4.tick() => CandlePeriod::Hour4,
                _ = day_1.tick() => CandlePeriod::Day1,
            };

            let tick = ClockTick {
                interval: period.as_str().to_string(),
                time: Utc::now(),
            };
            debug!(interval = period.as_str(), "clock tick");
            if let Err(error) =
                publish_json(bus.as_ref(), keys::clock_tick(period.as_str()), &tick).await
            {
                warn!(%error, "clock tick publish failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_bus::{memory::InMemoryBus, RoutingPattern};

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_publishes_interval_keys() {
        let bus = Arc::new(InMemoryBus::default());
        let mut ticks = bus
            .subscribe(RoutingPattern::new("system.clock.tick.1m"), "test")
            .await
            .unwrap();

        let handle = spawn_scheduler(bus.clone() as Arc<dyn MessageBus>);

        // The first tick of every interval fires immediately.
        let delivery = ticks.recv().await.unwrap();
        let tick: ClockTick = delivery.payload_as().unwrap();
        assert_eq!(tick.interval, "1m");

        handle.abort();
    }
}
