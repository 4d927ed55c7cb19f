use crate::{registry, series::BarSeries, Indicators, Signal, Strategy, StrategyError, WorkerEvent};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use stratus_bus::{key::keys, publish_json, Delivery, MessageBus, RoutingPattern};
use stratus_model::{
    event::{CapitalDenied, Heartbeat, WorkerControl},
    market::MarketEvent,
    proposal::{Proposal, ProposalId},
    strategy::StrategyRecord,
};
use stratus_store::Store;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Runtime tuning for a [`StrategyWorker`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Ring buffer capacity - the most recent N closed bars kept in memory.
    pub history_bars: usize,
    /// Minimum interval between emitted proposals, preventing oscillation.
    pub cooldown: Duration,
    /// How often the warm-restart snapshot is flushed to the store.
    pub snapshot_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            history_bars: 500,
            cooldown: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Warm-restart state: the bar history plus whatever the strategy itself
/// chose to persist.
#[derive(Debug, Deserialize, Serialize)]
struct WorkerSnapshot {
    series: BarSeries,
    strategy: Option<serde_json::Value>,
}

/// Executes exactly one strategy instance: a single-threaded event loop
/// consuming the strategy's declared subscriptions in arrival order,
/// publishing at most one proposal per update on
/// `request.capital.allocation.<strategy_id>`.
///
/// Each worker runs in its own OS process; this type is the whole of that
/// process's behaviour.
pub struct StrategyWorker {
    record: StrategyRecord,
    strategy: Box<dyn Strategy>,
    bus: Arc<dyn MessageBus>,
    store: Store,
    config: WorkerConfig,
    series: BarSeries,
    indicators: Indicators,
    last_price: Option<Decimal>,
    last_signal_at: Option<Instant>,
}

impl std::fmt::Debug for StrategyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyWorker")
            .field("strategy", &self.record.name)
            .field("bars", &self.series.len())
            .finish()
    }
}

impl StrategyWorker {
    pub fn new(
        record: StrategyRecord,
        bus: Arc<dyn MessageBus>,
        store: Store,
        config: WorkerConfig,
    ) -> Result<Self, StrategyError> {
        let strategy = registry::build(&record)?;
        let series = BarSeries::new(config.history_bars);
        Ok(Self {
            record,
            strategy,
            bus,
            store,
            config,
            series,
            indicators: Indicators::default(),
            last_price: None,
            last_signal_at: None,
        })
    }

    /// Run until a graceful stop arrives on `commands.worker.<strategy_id>`.
    pub async fn run(mut self) -> Result<(), StrategyError> {
        let strategy_id = self.record.id;
        let group = format!("worker-{strategy_id}");

        self.restore_snapshot()?;
        self.strategy.on_start();

        let mut control = self
            .bus
            .subscribe(
                RoutingPattern::new(keys::worker_control(strategy_id).as_str()),
                &group,
            )
            .await?;
        let mut denials = self
            .bus
            .subscribe(
                RoutingPattern::new(keys::capital_denied(strategy_id).as_str()),
                &group,
            )
            .await?;

        // One forwarder per declared subscription funnels into the single
        // event loop; per-subscription FIFO is preserved end to end.
        let (data_tx, mut data_rx) = mpsc::channel::<Delivery>(1024);
        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
        for key in self.strategy.required_subscriptions() {
            let mut subscription = self
                .bus
                .subscribe(RoutingPattern::new(key.as_str()), &group)
                .await?;
            let tx = data_tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(delivery) = subscription.recv().await {
                    if tx.send(delivery).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(data_tx);

        let mut snapshot_timer = tokio::time::interval(self.config.snapshot_interval);
        snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_timer = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(strategy = %self.record.name, %strategy_id, "strategy worker running");

        loop {
            tokio::select! {
                control_delivery = control.recv() => {
                    let Some(delivery) = control_delivery else { break };
                    let stop = matches!(
                        delivery.payload_as::<WorkerControl>(),
                        Ok(WorkerControl::Stop)
                    );
                    delivery.ack().await;
                    if stop {
                        info!(%strategy_id, "graceful stop requested");
                        break;
                    }
                }
                Some(delivery) = data_rx.recv() => {
                    self.handle_data(delivery).await;
                }
                Some(delivery) = denials.recv() => {
                    if let Ok(denied) = delivery.payload_as::<CapitalDenied>() {
                        warn!(
                            %strategy_id,
                            reason = %denied.reason,
                            detail = %denied.detail,
                            "proposal denied"
                        );
                    }
                }
                _ = snapshot_timer.tick() => {
                    if let Err(error) = self.flush_snapshot() {
                        warn!(%error, "snapshot flush failed");
                    }
                }
                _ = heartbeat_timer.tick() => {
                    let heartbeat = Heartbeat::new(
                        smol_str::SmolStr::new(format!("worker-{strategy_id}")),
                        Utc::now(),
                    );
                    let key = keys::health(&format!("worker-{strategy_id}"));
                    if let Err(error) = publish_json(self.bus.as_ref(), key, &heartbeat).await {
                        warn!(%error, "heartbeat publish failed");
                    }
                }
            }
        }

        // Graceful stop: current message already handled; flush and leave.
        for forwarder in forwarders {
            forwarder.abort();
        }
        if let Err(error) = self.flush_snapshot() {
            warn!(%error, "final snapshot flush failed");
        }
        self.strategy.on_stop();
        info!(%strategy_id, "strategy worker stopped");
        Ok(())
    }

    async fn handle_data(&mut self, delivery: Delivery) {
        let key = delivery.key().clone();
        let mut segments = key.segments();

        let signal = match segments.next() {
            Some("market_data") => {
                let Ok(event) = delivery.payload_as::<MarketEvent>() else {
                    warn!(%key, "undecodable market data frame");
                    return;
                };
                delivery.ack().await;
                self.last_price = Some(event.price());
                if let Some(candle) = event.closed_candle() {
                    self.series.push(candle.clone());
                    self.indicators = self.strategy.populate_indicators(&self.series);
                }
                self.strategy
                    .on_data(&WorkerEvent::Market(&event), &self.series, &self.indicators)
            }
            Some("system") => {
                delivery.ack().await;
                let event = WorkerEvent::Clock {
                    key: &key,
                    time: Utc::now(),
                    last_price: self.last_price,
                };
                self.strategy
                    .on_data(&event, &self.series, &self.indicators)
            }
            _ => {
                delivery.ack().await;
                None
            }
        };

        if let Some(signal) = signal {
            self.emit(signal).await;
        }
    }

    /// Publish a proposal unless the cooldown window is still open. A failed
    /// publish (saturated Capital Manager queue) is treated as a reject.
    async fn emit(&mut self, signal: Signal) {
        if let Some(last) = self.last_signal_at {
            if last.elapsed() < self.config.cooldown {
                debug!(strategy = %self.record.name, "signal suppressed by cooldown");
                return;
            }
        }

        let proposal = Proposal {
            proposal_id: ProposalId::random(),
            strategy_id: self.record.id,
            exchange: self.record.exchange,
            symbol: self.record.symbol.clone(),
            side: signal.side,
            signal_price: signal.signal_price,
            stop_loss_price: signal.stop_loss_price,
            take_profit_price: signal.take_profit_price,
            confidence: signal.confidence.clamp(0.0, 1.0),
            params: signal.params,
            time: Utc::now(),
        };

        let key = keys::capital_request(self.record.id);
        match publish_json(self.bus.as_ref(), key, &proposal).await {
            Ok(()) => {
                self.last_signal_at = Some(Instant::now());
                info!(
                    strategy = %self.record.name,
                    proposal = %proposal.proposal_id,
                    side = %proposal.side,
                    price = %proposal.signal_price,
                    "proposal published"
                );
            }
            Err(error) => {
                warn!(%error, "proposal publish rejected");
            }
        }
    }

    fn restore_snapshot(&mut self) -> Result<(), StrategyError> {
        let Some(snapshot) = self.store.load_snapshot(self.record.id)? else {
            return Ok(());
        };
        match serde_json::from_value::<WorkerSnapshot>(snapshot) {
            Ok(snapshot) => {
                self.series = snapshot.series;
                self.indicators = self.strategy.populate_indicators(&self.series);
                if let Some(state) = snapshot.strategy {
                    self.strategy.restore(state);
                }
                info!(
                    strategy = %self.record.name,
                    bars = self.series.len(),
                    "restored worker snapshot"
                );
            }
            Err(error) => {
                // A snapshot from an older build is discarded, not fatal.
                warn!(%error, "discarding unreadable snapshot");
            }
        }
        Ok(())
    }

    fn flush_snapshot(&self) -> Result<(), StrategyError> {
        let snapshot = WorkerSnapshot {
            series: self.series.clone(),
            strategy: self.strategy.snapshot(),
        };
        let value = serde_json::to_value(&snapshot)
            .map_err(|error| StrategyError::InvalidParameters {
                strategy_type: self.record.strategy_type.to_string(),
                error: error.to_string(),
            })?;
        self.store.save_snapshot(self.record.id, &value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratus_bus::memory::InMemoryBus;
    use stratus_model::{
        exchange::ExchangeId,
        instrument::Symbol,
        market::{Candle, CandlePeriod, MarketDataKind},
        strategy::{PositionSizing, StrategyId},
    };

    fn record(store: &Store) -> StrategyRecord {
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(10000))
            .unwrap();
        store
            .create_strategy(
                "sma-btc",
                "sma_cross",
                ExchangeId::Mock,
                &Symbol::new("BTC/USDT"),
                serde_json::json!({"fast": 2, "slow": 4}),
                Some(&PositionSizing::FixedFractional { risk_pct: dec!(0.01) }),
                portfolio.id,
            )
            .unwrap()
    }

    fn market_event(close: Decimal) -> MarketEvent {
        MarketEvent::new(
            ExchangeId::Mock,
            Symbol::new("BTC/USDT"),
            Utc::now(),
            Utc::now(),
            MarketDataKind::Candle(Candle {
                period: CandlePeriod::Minute1,
                open_time: Utc::now(),
                close_time: Utc::now(),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1),
                closed: true,
            }),
        )
    }

    #[tokio::test]
    async fn test_worker_emits_proposal_and_stops_gracefully() {
        let bus = Arc::new(InMemoryBus::default());
        let store = Store::open_in_memory().unwrap();
        let record = record(&store);
        let strategy_id = record.id;

        let config = WorkerConfig {
            cooldown: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let worker =
            StrategyWorker::new(record, bus.clone() as Arc<dyn MessageBus>, store.clone(), config)
                .unwrap();

        let mut proposals = bus
            .subscribe(RoutingPattern::new("request.capital.allocation.*"), "capital")
            .await
            .unwrap();
        let mut health = bus
            .subscribe(RoutingPattern::new("system.health.#"), "test")
            .await
            .unwrap();

        let handle = tokio::spawn(worker.run());

        // The first heartbeat fires once subscriptions exist; market data
        // published before that could be legitimately dropped.
        tokio::time::timeout(Duration::from_secs(2), health.recv())
            .await
            .expect("worker heartbeat")
            .expect("subscription open");

        // Crossover sequence: flat then rally.
        for close in [10, 10, 10, 10, 10, 14, 18] {
            publish_json(
                bus.as_ref(),
                keys::market_data(ExchangeId::Mock, &Symbol::new("BTC/USDT")),
                &market_event(Decimal::from(close)),
            )
            .await
            .unwrap();
        }

        let delivery = tokio::time::timeout(Duration::from_secs(2), proposals.recv())
            .await
            .expect("proposal within deadline")
            .expect("subscription open");
        let proposal: Proposal = delivery.payload_as().unwrap();
        delivery.ack().await;
        assert_eq!(proposal.strategy_id, strategy_id);
        assert_eq!(proposal.side, stratus_model::Side::Buy);

        // Graceful stop flushes a snapshot.
        publish_json(
            bus.as_ref(),
            keys::worker_control(strategy_id),
            &WorkerControl::Stop,
        )
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker exits")
            .unwrap()
            .unwrap();
        assert!(store.load_snapshot(strategy_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_signal() {
        let bus = Arc::new(InMemoryBus::default());
        let store = Store::open_in_memory().unwrap();
        let record = record(&store);

        let config = WorkerConfig {
            cooldown: Duration::from_secs(3600),
            ..WorkerConfig::default()
        };
        let worker =
            StrategyWorker::new(record, bus.clone() as Arc<dyn MessageBus>, store.clone(), config)
                .unwrap();

        let mut proposals = bus
            .subscribe(RoutingPattern::new("request.capital.allocation.*"), "capital")
            .await
            .unwrap();
        let mut health = bus
            .subscribe(RoutingPattern::new("system.health.#"), "test")
            .await
            .unwrap();

        let handle = tokio::spawn(worker.run());
        tokio::time::timeout(Duration::from_secs(2), health.recv())
            .await
            .expect("worker heartbeat")
            .expect("subscription open");

        // Two crossovers: buy then sell. Only the first survives the cooldown.
        for close in [10, 10, 10, 10, 10, 14, 18, 22, 26, 10, 6, 4, 2] {
            publish_json(
                bus.as_ref(),
                keys::market_data(ExchangeId::Mock, &Symbol::new("BTC/USDT")),
                &market_event(Decimal::from(close)),
            )
            .await
            .unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(2), proposals.recv())
            .await
            .expect("first proposal")
            .expect("subscription open");
        first.ack().await;

        let second = tokio::time::timeout(Duration::from_millis(300), proposals.recv()).await;
        assert!(second.is_err(), "cooldown should suppress the second signal");

        handle.abort();
    }
}
