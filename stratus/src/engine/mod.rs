use crate::{
    config::Config,
    system::SystemError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use stratus_bus::{error::BusError, key::keys, publish_json, MessageBus, RoutingPattern};
use stratus_exchange::client::ExecutionClient;
use stratus_model::{
    event::{
        Alert, CapitalDenied, Heartbeat, OperatorCommand, SystemReady, TradeExecuted, TradeFailed,
        WorkerControl,
    },
    exchange::ExchangeId,
    strategy::StrategyId,
};
use stratus_store::{error::StoreError, Store};
use tracing::{error, info, warn};

/// Component heartbeat tracking and lapse alerts.
pub mod health;

/// The State Reconciliation Protocol (startup and periodic).
pub mod reconcile;

/// Wall-clock tick publication for time-driven strategies.
pub mod scheduler;

/// Worker process spawning, crash observation and restart policy.
pub mod supervisor;

use health::HealthMonitor;
use reconcile::{ReconcileError, Reconciler};
use supervisor::{RestartDecision, Supervisor, SupervisorConfig, SupervisorEvent};

/// How long a worker gets to honour a graceful stop before being killed.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Cadence of the supervision sweep (child exits, due restarts).
const SUPERVISION_TICK: Duration = Duration::from_secs(1);

const HEALTH_CHECK_TICK: Duration = Duration::from_secs(15);
const HEARTBEAT_TICK: Duration = Duration::from_secs(10);
const HEARTBEAT_THRESHOLD: Duration = Duration::from_secs(30);

/// All fatal engine failures, mapped to the documented exit codes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    System(#[from] SystemError),

    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl EngineError {
    /// `0` normal, `1` config, `2` reconciliation failed, `3` bus/DB loss.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::System(system) => system.exit_code(),
            EngineError::Reconcile(_) => 2,
            EngineError::Store(_) | EngineError::Bus(_) => 3,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct EngineStats {
    trades_executed: u64,
    trades_failed: u64,
    proposals_denied: u64,
}

/// The system supervisor: boots in the mandatory order, reconciles before any
/// trading, spawns and watches workers, actions operator commands, and
/// aggregates global health.
pub struct Engine {
    config: Config,
    bus: Arc<dyn MessageBus>,
    store: Store,
    reconciler: Reconciler,
    supervisor: Supervisor,
    health: HealthMonitor,
    stats: EngineStats,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.supervisor.running_count())
            .finish()
    }
}

impl Engine {
    pub fn new(
        config: Config,
        config_path: &str,
        bus: Arc<dyn MessageBus>,
        store: Store,
        clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>>,
    ) -> Self {
        let reconciler = Reconciler::new(
            store.clone(),
            clients,
            config.reconcile.orphan_policy,
        );
        let supervisor = Supervisor::new(SupervisorConfig {
            binary: config.worker.binary.clone(),
            config_path: config_path.to_string(),
            restart_backoff: Duration::from_secs(config.worker.restart_backoff_secs),
            max_restarts_per_window: config.worker.max_restarts_per_window,
            restart_window: Duration::from_secs(config.worker.restart_window_secs),
        });
        Self {
            config,
            bus,
            store,
            reconciler,
            supervisor,
            health: HealthMonitor::new(HEARTBEAT_THRESHOLD),
            stats: EngineStats::default(),
        }
    }

    /// The mandatory startup sequence. Configuration, secrets, bus and DB are
    /// the caller's (the binary's) responsibility; from here:
    /// reconcile, spawn workers, subscribe, publish `system.ready`.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        // A crashed engine must not leave a stale green light behind.
        self.store.set_system_ready(false)?;

        let report = match self.reconciler.run(None).await {
            Ok(report) => report,
            Err(reconcile_error) => {
                let alert = Alert::critical(
                    "reconcile.failed",
                    format!("startup reconciliation failed: {reconcile_error}"),
                );
                let _ =
                    publish_json(self.bus.as_ref(), keys::alert("reconcile.failed"), &alert).await;
                // No workers, no trading.
                return Err(reconcile_error.into());
            }
        };
        let frozen = report.frozen();
        self.publish_alerts(report.alerts).await;
        if frozen {
            warn!("orphan positions froze trading; awaiting operator reconcile_now");
        }

        for strategy in self.store.strategies(true)? {
            if let Err(spawn_error) = self.supervisor.spawn_worker(strategy.id) {
                error!(%spawn_error, strategy = %strategy.name, "worker spawn failed");
                self.store.set_strategy_active(strategy.id, false)?;
                let alert = Alert::critical(
                    "strategy.halted",
                    format!("strategy {} failed to spawn: {spawn_error}", strategy.name),
                );
                let _ = publish_json(self.bus.as_ref(), keys::alert("strategy.halted"), &alert)
                    .await;
            }
        }

        scheduler::spawn_scheduler(Arc::clone(&self.bus));

        self.store.set_system_ready(true)?;
        publish_json(
            self.bus.as_ref(),
            keys::system_ready(),
            &SystemReady::new(Utc::now()),
        )
        .await?;
        info!(workers = self.supervisor.running_count(), "system ready");
        Ok(())
    }

    /// Boot, then run the supervision loop until shutdown.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.start().await?;

        let mut control = self
            .bus
            .subscribe(RoutingPattern::new("commands.control.*"), "engine")
            .await?;
        let mut events = self
            .bus
            .subscribe(RoutingPattern::new("events.#"), "engine")
            .await?;
        let mut heartbeats = self
            .bus
            .subscribe(RoutingPattern::new("system.health.#"), "engine")
            .await?;

        let mut supervision = tokio::time::interval(SUPERVISION_TICK);
        supervision.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reconcile_timer = tokio::time::interval(Duration::from_secs(
            self.config.reconcile.periodic_interval_secs.max(1),
        ));
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval's immediate first tick would re-run reconciliation
        // straight after startup.
        reconcile_timer.reset();
        let mut health_timer = tokio::time::interval(HEALTH_CHECK_TICK);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_timer = tokio::time::interval(HEARTBEAT_TICK);
        heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    self.shutdown().await;
                    return Ok(());
                }
                delivery = control.recv() => {
                    let Some(delivery) = delivery else {
                        self.shutdown().await;
                        return Ok(());
                    };
                    match delivery.payload_as::<OperatorCommand>() {
                        Ok(command) => self.handle_command(command).await,
                        Err(payload_error) => warn!(%payload_error, "undecodable operator command"),
                    }
                    delivery.ack().await;
                }
                Some(delivery) = events.recv() => {
                    self.aggregate_event(&delivery);
                }
                Some(delivery) = heartbeats.recv() => {
                    if let Ok(heartbeat) = delivery.payload_as::<Heartbeat>() {
                        self.health.observe(&heartbeat);
                    }
                }
                _ = supervision.tick() => {
                    self.supervise().await;
                }
                _ = reconcile_timer.tick() => {
                    self.periodic_reconcile().await;
                }
                _ = health_timer.tick() => {
                    for (component, last_seen) in self.health.newly_unhealthy(Utc::now()) {
                        let alert = Alert::warning(
                            "component.unhealthy",
                            format!("{component} last heartbeat at {last_seen}"),
                        );
                        let _ = publish_json(self.bus.as_ref(), keys::alert("component.unhealthy"), &alert).await;
                    }
                }
                _ = heartbeat_timer.tick() => {
                    let beat = Heartbeat::new("engine".into(), Utc::now());
                    let _ = publish_json(self.bus.as_ref(), keys::health("engine"), &beat).await;
                }
            }
        }
    }

    /// Global aggregation of `events.*` for `portfolio_status` telemetry.
    fn aggregate_event(&mut self, delivery: &stratus_bus::Delivery) {
        let key = delivery.key().as_str();
        if key == "events.trade_executed" {
            if delivery.payload_as::<TradeExecuted>().is_ok() {
                self.stats.trades_executed += 1;
            }
        } else if key == "events.trade_failed" {
            if let Ok(event) = delivery.payload_as::<TradeFailed>() {
                self.stats.trades_failed += 1;
                warn!(symbol = %event.symbol, kind = %event.kind, "trade failed: {}", event.reason);
            }
        } else if key.starts_with("events.capital.denied") {
            if delivery.payload_as::<CapitalDenied>().is_ok() {
                self.stats.proposals_denied += 1;
            }
        }
    }

    async fn supervise(&mut self) {
        for event in self.supervisor.poll() {
            match event {
                SupervisorEvent::Exited { strategy_id, status } => {
                    // Stopped strategies are released, not polled - an exit
                    // seen here is a crash.
                    warn!(%strategy_id, ?status, "worker exited unexpectedly");
                    match self.supervisor.on_exit(strategy_id) {
                        RestartDecision::RestartAfter(delay) => {
                            info!(%strategy_id, ?delay, "worker restart scheduled");
                        }
                        RestartDecision::GiveUp => {
                            error!(%strategy_id, "restart budget exhausted; halting strategy");
                            if let Err(store_error) =
                                self.store.set_strategy_active(strategy_id, false)
                            {
                                error!(%store_error, "failed to deactivate strategy");
                            }
                            let alert = Alert::critical(
                                "strategy.halted",
                                format!("strategy {strategy_id} crashed repeatedly; deactivated"),
                            );
                            let _ = publish_json(
                                self.bus.as_ref(),
                                keys::alert("strategy.halted"),
                                &alert,
                            )
                            .await;
                        }
                    }
                }
                SupervisorEvent::RestartDue { strategy_id } => {
                    let still_active = self
                        .store
                        .strategy(strategy_id)
                        .map(|strategy| strategy.is_active)
                        .unwrap_or(false);
                    if !still_active {
                        continue;
                    }
                    if let Err(spawn_error) = self.supervisor.spawn_worker(strategy_id) {
                        error!(%strategy_id, %spawn_error, "worker respawn failed");
                    }
                }
            }
        }
    }

    async fn periodic_reconcile(&mut self) {
        match self.reconciler.run(None).await {
            Ok(report) => {
                if report.writes() > 0 {
                    warn!(writes = report.writes(), "periodic reconciliation repaired drift");
                }
                self.publish_alerts(report.alerts).await;
            }
            Err(reconcile_error) => {
                error!(%reconcile_error, "periodic reconciliation failed");
                let alert = Alert::critical(
                    "reconcile.failed",
                    format!("periodic reconciliation failed: {reconcile_error}"),
                );
                let _ =
                    publish_json(self.bus.as_ref(), keys::alert("reconcile.failed"), &alert).await;
            }
        }
    }

    async fn handle_command(&mut self, command: OperatorCommand) {
        info!(op = command.op(), "operator command");
        match command {
            OperatorCommand::StartStrategy { id } => {
                let outcome = self.start_strategy(id).await;
                self.respond("start_strategy", outcome).await;
            }
            OperatorCommand::StopStrategy { id } => {
                let outcome = self.stop_strategy(id).await;
                self.respond("stop_strategy", outcome).await;
            }
            OperatorCommand::EmergencyHalt { reason } => {
                let reason = reason.unwrap_or_else(|| "operator emergency halt".to_string());
                let outcome = self
                    .store
                    .set_trading_halted(true, Some(&reason))
                    .map(|()| serde_json::json!({ "halted": true, "reason": reason.clone() }))
                    .map_err(|store_error| store_error.to_string());
                let _ = publish_json(
                    self.bus.as_ref(),
                    keys::system_halt(),
                    &serde_json::json!({ "reason": reason }),
                )
                .await;
                let alert = Alert::critical("emergency_halt", reason);
                let _ = publish_json(self.bus.as_ref(), keys::alert("emergency_halt"), &alert)
                    .await;
                self.respond("emergency_halt", outcome).await;
            }
            OperatorCommand::PortfolioStatus => {
                let outcome = self.portfolio_status();
                self.respond("portfolio_status", outcome).await;
            }
            OperatorCommand::StrategyList => {
                let outcome = self.strategy_list();
                self.respond("strategy_list", outcome).await;
            }
            OperatorCommand::ReconcileNow { orphan_policy } => {
                let outcome = match self.reconciler.run(orphan_policy).await {
                    Ok(report) => {
                        let summary = serde_json::json!({
                            "finalized_fills": report.finalized_fills,
                            "stale_canceled": report.stale_canceled,
                            "orphans_adopted": report.orphans_adopted,
                            "orphans_frozen": report.orphans_frozen,
                            "ledgers_repaired": report.ledgers_repaired,
                        });
                        let frozen = report.frozen();
                        self.publish_alerts(report.alerts).await;

                        // An explicit operator override that leaves no frozen
                        // orphans lifts a reconcile-imposed freeze. Operator
                        // emergency halts are never lifted implicitly.
                        if orphan_policy.is_some() && !frozen {
                            self.clear_orphan_freeze().await;
                        }
                        Ok(summary)
                    }
                    Err(reconcile_error) => Err(reconcile_error.to_string()),
                };
                self.respond("reconcile_now", outcome).await;
            }
        }
    }

    async fn start_strategy(&mut self, id: StrategyId) -> Result<serde_json::Value, String> {
        self.store
            .set_strategy_active(id, true)
            .map_err(|store_error| store_error.to_string())?;
        self.supervisor
            .spawn_worker(id)
            .map_err(|spawn_error| spawn_error.to_string())?;
        Ok(serde_json::json!({ "strategy_id": id, "running": true }))
    }

    async fn stop_strategy(&mut self, id: StrategyId) -> Result<serde_json::Value, String> {
        self.store
            .set_strategy_active(id, false)
            .map_err(|store_error| store_error.to_string())?;
        let _ = publish_json(
            self.bus.as_ref(),
            keys::worker_control(id),
            &WorkerControl::Stop,
        )
        .await;
        self.supervisor.release_worker(id, WORKER_STOP_GRACE);
        Ok(serde_json::json!({ "strategy_id": id, "running": false }))
    }

    fn portfolio_status(&self) -> Result<serde_json::Value, String> {
        let gather = || -> Result<serde_json::Value, StoreError> {
            let mut entries = Vec::new();
            for portfolio in self.store.portfolios()? {
                let positions = self.store.open_positions_for_portfolio(portfolio.id)?;
                let reservations = self.store.open_reservations(Some(portfolio.id))?;
                let open_notional: Decimal = positions
                    .iter()
                    .map(|position| position.current_size.abs() * position.entry_price)
                    .sum();
                entries.push(serde_json::json!({
                    "id": portfolio.id,
                    "name": portfolio.name,
                    "base_currency": portfolio.base_currency,
                    "total_capital": portfolio.total_capital,
                    "available_capital": portfolio.available_capital,
                    "reserved_capital": portfolio.reserved_capital(),
                    "open_positions": positions.len(),
                    "open_notional": open_notional,
                    "open_reservations": reservations.len(),
                    "is_active": portfolio.is_active,
                }));
            }
            let flags = self.store.system_flags()?;
            Ok(serde_json::json!({
                "portfolios": entries,
                "trading_allowed": flags.trading_allowed(),
                "halt_reason": flags.halt_reason,
                "stats": self.stats,
                "time": Utc::now(),
            }))
        };
        gather().map_err(|store_error| store_error.to_string())
    }

    fn strategy_list(&self) -> Result<serde_json::Value, String> {
        let gather = || -> Result<serde_json::Value, StoreError> {
            let strategies: Vec<serde_json::Value> = self
                .store
                .strategies(false)?
                .into_iter()
                .map(|strategy| {
                    serde_json::json!({
                        "id": strategy.id,
                        "name": strategy.name,
                        "strategy_type": strategy.strategy_type,
                        "exchange": strategy.exchange,
                        "symbol": strategy.symbol,
                        "is_active": strategy.is_active,
                        "running": self.supervisor.is_running(strategy.id),
                    })
                })
                .collect();
            Ok(serde_json::json!({
                "strategies": strategies,
                "registered_types": stratus_strategy::registry::registered_types(),
            }))
        };
        gather().map_err(|store_error| store_error.to_string())
    }

    /// Operator command responses land on `events.control.<op>` for UIs
    /// subscribed to `events.#`.
    async fn respond(&self, op: &str, outcome: Result<serde_json::Value, String>) {
        let payload = match outcome {
            Ok(result) => serde_json::json!({ "op": op, "ok": true, "result": result }),
            Err(failure) => {
                warn!(op, %failure, "operator command failed");
                serde_json::json!({ "op": op, "ok": false, "error": failure })
            }
        };
        let key = stratus_bus::RoutingKey::new(format!("events.control.{op}"));
        if let Err(publish_error) = self.bus.publish(stratus_bus::Envelope::new(key, payload)).await
        {
            error!(%publish_error, "command response publish failed");
        }
    }

    async fn clear_orphan_freeze(&self) {
        match self.store.system_flags() {
            Ok(flags) if flags.trading_halted => {
                let orphan_freeze = flags
                    .halt_reason
                    .as_deref()
                    .is_some_and(|reason| reason.starts_with("orphan position"));
                if orphan_freeze {
                    if let Err(store_error) = self.store.set_trading_halted(false, None) {
                        error!(%store_error, "failed to clear orphan freeze");
                    } else {
                        info!("orphan freeze lifted by operator reconcile");
                    }
                }
            }
            Ok(_) => {}
            Err(store_error) => error!(%store_error, "system flags read failed"),
        }
    }

    async fn publish_alerts(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            let key = keys::alert(alert.code.as_str());
            if let Err(publish_error) = publish_json(self.bus.as_ref(), key, &alert).await {
                error!(%publish_error, "alert publish failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("stopping workers");
        let strategies = self.store.strategies(true).unwrap_or_default();
        for strategy in strategies {
            let _ = publish_json(
                self.bus.as_ref(),
                keys::worker_control(strategy.id),
                &WorkerControl::Stop,
            )
            .await;
            self.supervisor.release_worker(strategy.id, WORKER_STOP_GRACE);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("engine stopped");
    }
}
