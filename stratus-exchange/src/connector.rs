use crate::{
    cache::PriceCache,
    client::{ExecutionClient, OrderSnapshot},
    error::ExchangeError,
    limit::RateLimiter,
};
use chrono::Utc;
use rand::Rng;
use std::{collections::HashMap, sync::Arc, time::Duration};
use stratus_bus::{key::keys, publish_json, MessageBus, RoutingPattern};
use stratus_model::{
    error::ErrorKind,
    event::{Alert, Heartbeat, TradeExecuted, TradeFailed},
    exchange::ExchangeId,
    order::{ClientOrderId, ExecuteTrade, TradeStatus},
};
use stratus_store::{trade::NewTrade, Store};
use tracing::{error, info, warn};

/// Rate-limiter bucket name for order placement.
pub const ENDPOINT_ORDER: &str = "order";

/// Runtime tuning for the [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Bounded retry attempts for transient placement failures.
    pub max_retries: u32,
    /// Base backoff between retries; jittered and doubled per attempt.
    pub retry_backoff: Duration,
    /// How long a resting order is tracked before handing over to the
    /// Capital Manager timeout / reconciliation.
    pub order_deadline: Duration,
    /// Status poll cadence for resting orders.
    pub poll_interval: Duration,
    /// Bounded wait for a rate-limit token.
    pub rate_limit_budget: Duration,
    pub heartbeat_interval: Duration,
    /// Log intended orders; fills are synthetic (mock clients injected).
    pub dry_run: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            order_deadline: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            rate_limit_budget: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            dry_run: false,
        }
    }
}

/// The execution half of the Exchange Connector: consumes
/// `commands.execute_trade` FIFO, translates to venue calls, journals every
/// transition, and emits exactly one terminal event per order.
///
/// Commands are processed serially, preserving order-of-intent per exchange
/// and symbol.
pub struct Connector {
    bus: Arc<dyn MessageBus>,
    store: Store,
    clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>>,
    limiter: Arc<RateLimiter>,
    cache: PriceCache,
    config: ConnectorConfig,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("exchanges", &self.clients.keys().collect::<Vec<_>>())
            .field("dry_run", &self.config.dry_run)
            .finish()
    }
}

impl Connector {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Store,
        clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>>,
        limiter: Arc<RateLimiter>,
        cache: PriceCache,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            bus,
            store,
            clients,
            limiter,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> PriceCache {
        self.cache.clone()
    }

    /// Consume `commands.execute_trade` until the bus closes.
    pub async fn run(&self) -> Result<(), crate::error::ExchangeError> {
        let mut commands = self
            .bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(dry_run = self.config.dry_run, "connector running");
        loop {
            tokio::select! {
                delivery = commands.recv() => {
                    let Some(delivery) = delivery else { break };
                    match delivery.payload_as::<ExecuteTrade>() {
                        Ok(command) => {
                            self.handle_execute(command).await;
                            delivery.ack().await;
                        }
                        Err(payload_error) => {
                            error!(%payload_error, "undecodable execute_trade command");
                            delivery.ack().await;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Heartbeat::new("connector".into(), Utc::now());
                    let _ = publish_json(self.bus.as_ref(), keys::health("connector"), &beat).await;
                }
            }
        }
        Ok(())
    }

    /// Execute one approved order end to end.
    pub async fn handle_execute(&self, command: ExecuteTrade) {
        let client_order_id = ClientOrderId::from(command.proposal_id);

        // Journal first: the order exists from the moment we saw the command.
        let journaled = match self.store.save_trade(&NewTrade {
            strategy_id: command.order.strategy_id,
            exchange: command.order.exchange,
            symbol: command.order.symbol.clone(),
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            reservation_id: Some(command.reservation_id),
            kind: command.order.kind,
            side: command.order.side,
            amount: command.order.amount,
            price: command.order.price,
            status: TradeStatus::Pending,
        }) {
            Ok(journaled) => journaled,
            Err(db_error) => {
                error!(%db_error, "journal write failed; refusing order");
                self.emit_failed(&command, ErrorKind::DbUnavailable, db_error.to_string())
                    .await;
                return;
            }
        };

        // Idempotent redelivery: already terminal means the event may have
        // been lost mid-publish - re-emit, never re-execute.
        if journaled.status.is_terminal() {
            info!(%client_order_id, status = %journaled.status, "redelivered terminal order; re-emitting event");
            match journaled.status {
                TradeStatus::Filled | TradeStatus::Canceled => {
                    if let Some(exchange_order_id) = &journaled.exchange_order_id {
                        let event = TradeExecuted {
                            proposal_id: command.proposal_id,
                            reservation_id: Some(command.reservation_id),
                            strategy_id: journaled.strategy_id,
                            exchange: journaled.exchange,
                            symbol: journaled.symbol.clone(),
                            side: journaled.side,
                            exchange_order_id: exchange_order_id.clone(),
                            client_order_id,
                            status: journaled.status,
                            fill: stratus_model::order::FillInfo {
                                filled_amount: journaled.filled_amount,
                                avg_fill_price: journaled.avg_fill_price,
                                fee: journaled.fee,
                            },
                            time: Utc::now(),
                        };
                        let _ = publish_json(self.bus.as_ref(), keys::trade_executed(), &event).await;
                    }
                }
                _ => {
                    self.emit_failed(&command, ErrorKind::ExchangePermanent, "order previously failed".to_string())
                        .await;
                }
            }
            return;
        }

        // The ready/halt gate survives restarts in the store.
        match self.store.system_flags() {
            Ok(flags) if flags.trading_allowed() => {}
            Ok(flags) => {
                let reason = flags
                    .halt_reason
                    .unwrap_or_else(|| "system not ready".to_string());
                warn!(%client_order_id, %reason, "refusing order while trading disallowed");
                self.fail_order(&command, &client_order_id, ErrorKind::ValidationFailed, reason)
                    .await;
                return;
            }
            Err(db_error) => {
                self.fail_order(&command, &client_order_id, ErrorKind::DbUnavailable, db_error.to_string())
                    .await;
                return;
            }
        }

        let Some(client) = self.clients.get(&command.order.exchange) else {
            self.fail_order(
                &command,
                &client_order_id,
                ErrorKind::ExchangePermanent,
                format!("no client configured for {}", command.order.exchange),
            )
            .await;
            return;
        };

        // Rate limit with a bounded wait; overflow fails just this order.
        if !self
            .limiter
            .acquire(ENDPOINT_ORDER, self.config.rate_limit_budget)
            .await
        {
            let alert = Alert::warning(
                "rate_limit",
                format!("{} order bucket saturated", command.order.exchange),
            );
            let _ = publish_json(self.bus.as_ref(), keys::alert("rate_limit"), &alert).await;
            self.fail_order(
                &command,
                &client_order_id,
                ErrorKind::RateLimited,
                "rate limit queue budget exhausted".to_string(),
            )
            .await;
            return;
        }

        if self.config.dry_run {
            info!(
                symbol = %command.order.symbol,
                side = %command.order.side,
                amount = %command.order.amount,
                "dry run order (synthetic fill follows)"
            );
        }

        match self.place_with_retry(client.as_ref(), &command, &client_order_id).await {
            Ok(snapshot) => {
                self.track_to_terminal(client.as_ref(), &command, snapshot)
                    .await;
            }
            Err(exchange_error) => {
                let kind = exchange_error.kind();
                self.fail_order(&command, &client_order_id, kind, exchange_error.to_string())
                    .await;
            }
        }
    }

    /// Submit with bounded, jittered retries for transient failures. Before
    /// every retry the order status is checked first - a timed-out call may
    /// have succeeded on the venue.
    async fn place_with_retry(
        &self,
        client: &dyn ExecutionClient,
        command: &ExecuteTrade,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let mut attempt = 0u32;
        loop {
            match client.place_order(&command.order, client_order_id).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(placement_error) => {
                    if !placement_error.is_retryable() || attempt >= self.config.max_retries {
                        return Err(placement_error);
                    }
                    attempt += 1;
                    let base = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    let jitter = Duration::from_millis(
                        rand::rng().random_range(0..=(base.as_millis() as u64) / 2),
                    );
                    warn!(
                        %client_order_id,
                        %placement_error,
                        attempt,
                        backoff = ?(base + jitter),
                        "transient placement failure; retrying"
                    );
                    tokio::time::sleep(base + jitter).await;

                    // Idempotency check: did the failed call actually land?
                    if let Ok(Some(existing)) = client
                        .fetch_order(&command.order.symbol, client_order_id)
                        .await
                    {
                        return Ok(existing);
                    }
                }
            }
        }
    }

    /// Follow an accepted order until it reaches a terminal state or the
    /// tracking deadline expires.
    async fn track_to_terminal(
        &self,
        client: &dyn ExecutionClient,
        command: &ExecuteTrade,
        accepted: OrderSnapshot,
    ) {
        let client_order_id = accepted.client_order_id.clone();
        if let Err(db_error) = self
            .store
            .attach_exchange_order_id(&client_order_id, &accepted.exchange_order_id)
        {
            error!(%db_error, "failed to journal exchange order id");
        }
        // `submitted` is written immediately after the exchange accepts.
        self.journal_transition(&client_order_id, TradeStatus::Submitted, None);

        let mut snapshot = accepted;
        let deadline = tokio::time::Instant::now() + self.config.order_deadline;
        while !snapshot.status.is_terminal() {
            self.journal_transition(&client_order_id, snapshot.status, Some(&snapshot));
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    %client_order_id,
                    status = %snapshot.status,
                    "order still working at tracking deadline; deferring to reconciliation"
                );
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
            match client
                .fetch_order(&command.order.symbol, &client_order_id)
                .await
            {
                Ok(Some(update)) => snapshot = update,
                Ok(None) => {
                    warn!(%client_order_id, "order vanished from venue; deferring to reconciliation");
                    return;
                }
                Err(poll_error) if poll_error.is_retryable() => continue,
                Err(poll_error) => {
                    error!(%client_order_id, %poll_error, "status polling failed");
                    return;
                }
            }
        }

        self.journal_transition(&client_order_id, snapshot.status, Some(&snapshot));
        self.cache
            .insert(snapshot.exchange, &snapshot.symbol, snapshot.avg_fill_price.unwrap_or_default());

        match snapshot.status {
            TradeStatus::Filled | TradeStatus::Canceled => {
                let event = TradeExecuted {
                    proposal_id: command.proposal_id,
                    reservation_id: Some(command.reservation_id),
                    strategy_id: command.order.strategy_id,
                    exchange: snapshot.exchange,
                    symbol: snapshot.symbol.clone(),
                    side: snapshot.side,
                    exchange_order_id: snapshot.exchange_order_id.clone(),
                    client_order_id,
                    status: snapshot.status,
                    fill: snapshot.fill_info(),
                    time: Utc::now(),
                };
                info!(
                    symbol = %event.symbol,
                    side = %event.side,
                    filled = %event.fill.filled_amount,
                    "trade executed"
                );
                let _ = publish_json(self.bus.as_ref(), keys::trade_executed(), &event).await;
            }
            _ => {
                self.emit_failed(
                    command,
                    ErrorKind::ExchangePermanent,
                    format!("order reached {}", snapshot.status),
                )
                .await;
            }
        }
    }

    /// Record a failed/rejected order and emit its single terminal event.
    async fn fail_order(
        &self,
        command: &ExecuteTrade,
        client_order_id: &ClientOrderId,
        kind: ErrorKind,
        reason: String,
    ) {
        let status = match kind {
            ErrorKind::ExchangePermanent => TradeStatus::Rejected,
            _ => TradeStatus::Failed,
        };
        self.journal_transition(client_order_id, status, None);
        self.emit_failed(command, kind, reason).await;
    }

    async fn emit_failed(&self, command: &ExecuteTrade, kind: ErrorKind, reason: String) {
        let event = TradeFailed {
            proposal_id: command.proposal_id,
            reservation_id: Some(command.reservation_id),
            strategy_id: command.order.strategy_id,
            exchange: command.order.exchange,
            symbol: command.order.symbol.clone(),
            side: command.order.side,
            kind,
            reason,
            time: Utc::now(),
        };
        warn!(symbol = %event.symbol, %kind, reason = %event.reason, "trade failed");
        let _ = publish_json(self.bus.as_ref(), keys::trade_failed(), &event).await;
    }

    fn journal_transition(
        &self,
        client_order_id: &ClientOrderId,
        status: TradeStatus,
        snapshot: Option<&OrderSnapshot>,
    ) {
        let fill = snapshot.map(|snapshot| snapshot.fill_info());
        match self
            .store
            .update_trade_status(client_order_id, status, fill.as_ref(), None)
        {
            Ok(_) => {}
            Err(stratus_store::error::StoreError::InvalidTransition { from, to }) => {
                // Poll races can observe an already-advanced journal.
                warn!(%client_order_id, %from, %to, "skipped non-monotonic journal transition");
            }
            Err(db_error) => error!(%db_error, "journal transition failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockExchange, MockExchangeConfig};
    use rust_decimal_macros::dec;
    use stratus_bus::memory::InMemoryBus;
    use stratus_model::{
        instrument::Symbol,
        order::{OrderKind, OrderRequest},
        portfolio::ReservationId,
        proposal::ProposalId,
        strategy::StrategyId,
        Side,
    };

    struct Harness {
        bus: Arc<InMemoryBus>,
        store: Store,
        mock: MockExchange,
        connector: Connector,
    }

    fn harness(mock_config: MockExchangeConfig, config: ConnectorConfig) -> Harness {
        let bus = Arc::new(InMemoryBus::default());
        let store = Store::open_in_memory().unwrap();
        store.set_system_ready(true).unwrap();
        let mock = MockExchange::new(mock_config);
        mock.set_price(&Symbol::new("BTC/USDT"), dec!(50010));

        let mut clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>> = HashMap::new();
        clients.insert(ExchangeId::Mock, Arc::new(mock.clone()));

        let limiter = Arc::new(RateLimiter::new(dec!(0.1)));
        let connector = Connector::new(
            bus.clone() as Arc<dyn MessageBus>,
            store.clone(),
            clients,
            limiter,
            PriceCache::new(Duration::from_secs(5)),
            config,
        );
        Harness {
            bus,
            store,
            mock,
            connector,
        }
    }

    fn command() -> ExecuteTrade {
        ExecuteTrade {
            proposal_id: ProposalId::random(),
            reservation_id: ReservationId(1),
            order: OrderRequest {
                strategy_id: StrategyId(1),
                exchange: ExchangeId::Mock,
                symbol: Symbol::new("BTC/USDT"),
                side: Side::Buy,
                kind: OrderKind::Market,
                amount: dec!(0.02),
                price: None,
                stop_loss_price: Some(dec!(49000)),
                take_profit_price: None,
            },
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_emits_trade_executed() {
        let harness = harness(MockExchangeConfig::default(), ConnectorConfig::default());
        let mut events = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_executed"), "test")
            .await
            .unwrap();

        let command = command();
        let cid = ClientOrderId::from(command.proposal_id);
        harness.connector.handle_execute(command.clone()).await;

        let delivery = events.recv().await.unwrap();
        let event: TradeExecuted = delivery.payload_as().unwrap();
        assert_eq!(event.status, TradeStatus::Filled);
        assert_eq!(event.fill.filled_amount, dec!(0.02));
        assert_eq!(event.fill.avg_fill_price, Some(dec!(50010)));
        assert_eq!(event.reservation_id, Some(command.reservation_id));

        let trade = harness.store.trade_by_client_order_id(&cid).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert!(trade.exchange_order_id.is_some());
    }

    #[tokio::test]
    async fn test_refuses_before_system_ready() {
        let harness = harness(MockExchangeConfig::default(), ConnectorConfig::default());
        harness.store.set_system_ready(false).unwrap();
        let mut events = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_failed"), "test")
            .await
            .unwrap();

        harness.connector.handle_execute(command()).await;

        let delivery = events.recv().await.unwrap();
        let event: TradeFailed = delivery.payload_as().unwrap();
        assert_eq!(event.kind, ErrorKind::ValidationFailed);
        // Nothing reached the venue.
        assert!(harness.mock.open_orders().await.unwrap().is_empty());
        assert!(harness.mock.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let config = ConnectorConfig {
            retry_backoff: Duration::from_millis(1),
            ..ConnectorConfig::default()
        };
        let harness = harness(MockExchangeConfig::default(), config);
        harness
            .mock
            .fail_next_place(ExchangeError::Transient("gateway glitch".to_string()));
        let mut events = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_executed"), "test")
            .await
            .unwrap();

        harness.connector.handle_execute(command()).await;

        let event: TradeExecuted = events.recv().await.unwrap().payload_as().unwrap();
        assert_eq!(event.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_permanent_failure_rejects_without_retry() {
        let harness = harness(MockExchangeConfig::default(), ConnectorConfig::default());
        harness
            .mock
            .fail_next_place(ExchangeError::Permanent("insufficient funds".to_string()));
        let mut events = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_failed"), "test")
            .await
            .unwrap();

        let command = command();
        let cid = ClientOrderId::from(command.proposal_id);
        harness.connector.handle_execute(command).await;

        let event: TradeFailed = events.recv().await.unwrap().payload_as().unwrap();
        assert_eq!(event.kind, ErrorKind::ExchangePermanent);
        let trade = harness.store.trade_by_client_order_id(&cid).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
        // One scripted failure, no retry: the venue never saw a second call.
        assert!(harness.mock.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_fails_only_excess_order() {
        let config = ConnectorConfig {
            rate_limit_budget: Duration::from_millis(10),
            ..ConnectorConfig::default()
        };
        let harness = harness(MockExchangeConfig::default(), config);
        // 3/min under a 10% margin yields a 2.7-token bucket: two orders fit.
        harness.connector.limiter.register(ENDPOINT_ORDER, 3);

        let mut executed = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_executed"), "test")
            .await
            .unwrap();
        let mut failed = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_failed"), "test")
            .await
            .unwrap();

        harness.connector.handle_execute(command()).await;
        harness.connector.handle_execute(command()).await;
        harness.connector.handle_execute(command()).await;

        // First two succeed, third fails rate_limited.
        assert!(executed.recv().await.is_some());
        assert!(executed.recv().await.is_some());
        let event: TradeFailed = failed.recv().await.unwrap().payload_as().unwrap();
        assert_eq!(event.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_redelivered_terminal_command_reemits_without_reexecution() {
        let harness = harness(MockExchangeConfig::default(), ConnectorConfig::default());
        let mut events = harness
            .bus
            .subscribe(RoutingPattern::new("events.trade_executed"), "test")
            .await
            .unwrap();

        let command = command();
        harness.connector.handle_execute(command.clone()).await;
        harness.connector.handle_execute(command).await;

        let first: TradeExecuted = events.recv().await.unwrap().payload_as().unwrap();
        let second: TradeExecuted = events.recv().await.unwrap().payload_as().unwrap();
        assert_eq!(first.exchange_order_id, second.exchange_order_id);
        // Executed once: the venue position reflects a single fill.
        assert_eq!(harness.mock.positions().await.unwrap()[0].amount, dec!(0.02));
    }
}
