use crate::{rules, sizing, CapitalError, Denial};
use chrono::{Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use stratus_bus::{key::keys, publish_json, MessageBus, RoutingPattern};
use stratus_model::{
    event::{Alert, CapitalDenied, Heartbeat, TradeExecuted, TradeFailed},
    exchange::ExchangeId,
    instrument::Symbol,
    market::MarketEvent,
    order::{ClientOrderId, ExecuteTrade, OrderKind, OrderRequest, TradeRecord},
    portfolio::ReservationId,
    proposal::Proposal,
    strategy::PositionSizing,
    Side,
};
use stratus_strategy::{indicators, series::BarSeries};
use stratus_store::{error::StoreError, Store};
use tracing::{error, info, warn};

/// Runtime tuning for the [`CapitalManager`].
#[derive(Debug, Clone)]
pub struct CapitalManagerConfig {
    /// Sizing model applied to strategies whose row does not pin one.
    pub default_sizing: PositionSizing,
    /// Global safety cap on fractional Kelly.
    pub kelly_max_fraction: Decimal,
    /// Minimum closed trades before Kelly sizes anything.
    pub kelly_min_trades: usize,
    /// How many recent closed trades feed the Kelly estimate.
    pub kelly_lookback: usize,
    /// Age at which an open reservation is investigated by the sweeper.
    pub reservation_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Candle history kept per symbol for ATR sizing.
    pub atr_history: usize,
}

impl Default for CapitalManagerConfig {
    fn default() -> Self {
        Self {
            default_sizing: PositionSizing::FixedFractional {
                risk_pct: Decimal::new(1, 2), // 0.01
            },
            kelly_max_fraction: Decimal::new(2, 1), // 0.2
            kelly_min_trades: 10,
            kelly_lookback: 50,
            reservation_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            atr_history: 128,
        }
    }
}

enum Refusal {
    Denied(Denial),
    Infra(CapitalError),
}

impl From<StoreError> for Refusal {
    fn from(error: StoreError) -> Self {
        Refusal::Infra(CapitalError::Store(error))
    }
}

/// The central gatekeeper: every proposal is validated, sized, reserved and
/// only then forwarded as `commands.execute_trade`.
///
/// Single-threaded by construction - one event loop is the per-portfolio
/// single-writer region the ledger requires; the store's transactions are the
/// backstop.
pub struct CapitalManager {
    bus: Arc<dyn MessageBus>,
    store: Store,
    config: CapitalManagerConfig,
    candles: FnvHashMap<(ExchangeId, Symbol), BarSeries>,
}

impl std::fmt::Debug for CapitalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapitalManager")
            .field("tracked_symbols", &self.candles.len())
            .finish()
    }
}

impl CapitalManager {
    pub fn new(bus: Arc<dyn MessageBus>, store: Store, config: CapitalManagerConfig) -> Self {
        Self {
            bus,
            store,
            config,
            candles: FnvHashMap::default(),
        }
    }

    /// Consume proposals and terminal events until the bus closes.
    pub async fn run(&mut self) -> Result<(), CapitalError> {
        let mut requests = self
            .bus
            .subscribe(RoutingPattern::new("request.capital.allocation.*"), "capital")
            .await?;
        let mut executed = self
            .bus
            .subscribe(RoutingPattern::new("events.trade_executed"), "capital")
            .await?;
        let mut failed = self
            .bus
            .subscribe(RoutingPattern::new("events.trade_failed"), "capital")
            .await?;
        let mut market = self
            .bus
            .subscribe(RoutingPattern::new("market_data.#"), "capital")
            .await?;

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("capital manager running");
        loop {
            tokio::select! {
                delivery = requests.recv() => {
                    let Some(delivery) = delivery else { break };
                    match delivery.payload_as::<Proposal>() {
                        Ok(proposal) => {
                            // Processed before ack: a crash mid-pipeline
                            // redelivers the proposal, and the idempotent
                            // journal absorbs the replay.
                            self.handle_proposal(proposal).await;
                        }
                        Err(payload_error) => warn!(%payload_error, "undecodable proposal"),
                    }
                    delivery.ack().await;
                }
                Some(delivery) = executed.recv() => {
                    match delivery.payload_as::<TradeExecuted>() {
                        Ok(event) => self.handle_executed(&event),
                        Err(payload_error) => warn!(%payload_error, "undecodable trade_executed"),
                    }
                }
                Some(delivery) = failed.recv() => {
                    match delivery.payload_as::<TradeFailed>() {
                        Ok(event) => self.handle_failed(&event),
                        Err(payload_error) => warn!(%payload_error, "undecodable trade_failed"),
                    }
                }
                Some(delivery) = market.recv() => {
                    if let Ok(event) = delivery.payload_as::<MarketEvent>() {
                        self.on_market(&event);
                    }
                }
                _ = sweep.tick() => {
                    if let Err(sweep_error) = self.sweep_reservations().await {
                        error!(%sweep_error, "reservation sweep failed");
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Heartbeat::new("capital".into(), Utc::now());
                    let _ = publish_json(self.bus.as_ref(), keys::health("capital"), &beat).await;
                }
            }
        }
        Ok(())
    }

    /// Track closed bars per symbol for volatility-adjusted sizing. The bus
    /// remains the only inter-component channel - no connector query
    /// side-channel.
    pub fn on_market(&mut self, event: &MarketEvent) {
        if let Some(candle) = event.closed_candle() {
            self.candles
                .entry((event.exchange, event.symbol.clone()))
                .or_insert_with(|| BarSeries::new(self.config.atr_history))
                .push(candle.clone());
        }
    }

    /// Run one proposal through the full pipeline, publishing either an
    /// `execute_trade` command or a denial.
    pub async fn handle_proposal(&mut self, proposal: Proposal) {
        let strategy_id = proposal.strategy_id;
        match self.evaluate(&proposal) {
            Ok(command) => {
                info!(
                    %strategy_id,
                    proposal = %proposal.proposal_id,
                    amount = %command.order.amount,
                    reservation = %command.reservation_id,
                    "proposal approved"
                );
                if let Err(publish_error) =
                    publish_json(self.bus.as_ref(), keys::execute_trade(), &command).await
                {
                    // The reservation was created strictly before the
                    // command; a failed publish must roll it back.
                    error!(%publish_error, "execute_trade publish failed; rolling back reservation");
                    if let Err(rollback_error) = self.store.release_capital(command.reservation_id)
                    {
                        error!(%rollback_error, "reservation rollback failed");
                    }
                    self.deny(
                        &proposal,
                        Denial::new("bus_unavailable", publish_error.to_string()),
                    )
                    .await;
                }
            }
            Err(Refusal::Denied(denial)) => {
                self.deny(&proposal, denial).await;
            }
            Err(Refusal::Infra(infra_error)) => {
                error!(%infra_error, %strategy_id, "proposal pipeline infrastructure failure");
                self.deny(
                    &proposal,
                    Denial::new("db_unavailable", infra_error.to_string()),
                )
                .await;
            }
        }
    }

    fn evaluate(&self, proposal: &Proposal) -> Result<ExecuteTrade, Refusal> {
        // 1. Resolve the portfolio through strategy_portfolio_map.
        let strategy = match self.store.strategy(proposal.strategy_id) {
            Ok(strategy) => strategy,
            Err(StoreError::NotFound { .. }) => {
                return Err(Refusal::Denied(Denial::new(
                    "unknown_strategy",
                    format!("strategy {} not configured", proposal.strategy_id),
                )));
            }
            Err(store_error) => return Err(store_error.into()),
        };
        let portfolio = self
            .store
            .portfolio_for_strategy(proposal.strategy_id)?
            .ok_or_else(|| {
                Refusal::Denied(Denial::new(
                    "no_portfolio",
                    format!("strategy {} maps to no portfolio", proposal.strategy_id),
                ))
            })?;
        if !portfolio.is_active {
            return Err(Refusal::Denied(Denial::new(
                "portfolio_inactive",
                format!("portfolio {} is inactive", portfolio.name),
            )));
        }

        let rule_set = self.store.rules(portfolio.id)?;
        let open_positions = self.store.open_positions_for_portfolio(portfolio.id)?;
        let daily_realized_pnl = self
            .store
            .realized_pnl_since(portfolio.id, Utc::now() - ChronoDuration::hours(24))?;
        let context = rules::RuleContext {
            portfolio: &portfolio,
            open_positions: &open_positions,
            daily_realized_pnl,
        };

        // 2. Pre-sizing rule chain.
        rules::check_pre_sizing(&rule_set, &context, proposal).map_err(Refusal::Denied)?;

        // 3. Position sizing, falling back to the configured default model.
        let sizing_model = strategy
            .position_sizing
            .as_ref()
            .unwrap_or(&self.config.default_sizing);
        let atr = match sizing_model {
            PositionSizing::VolatilityAdjusted { atr_period, .. } => self
                .candles
                .get(&(proposal.exchange, proposal.symbol.clone()))
                .and_then(|series| indicators::atr(series, *atr_period)),
            _ => None,
        };
        let recent_trades = match sizing_model {
            PositionSizing::Kelly { .. } => self
                .store
                .recent_closed_trades(proposal.strategy_id, self.config.kelly_lookback)?,
            _ => Vec::new(),
        };
        let amount = sizing::size(&sizing::SizingInputs {
            proposal,
            portfolio: &portfolio,
            sizing: sizing_model,
            atr,
            recent_trades: &recent_trades,
            kelly_max_fraction: self.config.kelly_max_fraction,
            kelly_min_trades: self.config.kelly_min_trades,
        })
        .map_err(Refusal::Denied)?;
        let notional = sizing::notional(proposal, amount);

        // 4. Notional rule chain.
        rules::check_notional(&rule_set, &context, proposal, notional)
            .map_err(Refusal::Denied)?;

        // 5. Atomic reservation.
        let reservation = match self
            .store
            .reserve_capital(portfolio.id, proposal.strategy_id, notional)
        {
            Ok(reservation) => reservation,
            Err(StoreError::InsufficientCapital { requested, available }) => {
                return Err(Refusal::Denied(Denial::new(
                    "insufficient_capital",
                    format!("requested {requested}, available {available}"),
                )));
            }
            Err(store_error) => return Err(store_error.into()),
        };

        Ok(ExecuteTrade {
            proposal_id: proposal.proposal_id,
            reservation_id: reservation.id,
            order: OrderRequest {
                strategy_id: proposal.strategy_id,
                exchange: proposal.exchange,
                symbol: proposal.symbol.clone(),
                side: proposal.side,
                kind: OrderKind::Market,
                amount,
                price: None,
                stop_loss_price: proposal.stop_loss_price,
                take_profit_price: proposal.take_profit_price,
            },
            time: Utc::now(),
        })
    }

    async fn deny(&self, proposal: &Proposal, denial: Denial) {
        warn!(
            strategy = %proposal.strategy_id,
            proposal = %proposal.proposal_id,
            reason = %denial.reason,
            detail = %denial.detail,
            "proposal denied"
        );
        let event = CapitalDenied {
            proposal_id: proposal.proposal_id,
            strategy_id: proposal.strategy_id,
            reason: denial.reason.clone(),
            detail: denial.detail.clone(),
            time: Utc::now(),
        };
        let key = keys::capital_denied(proposal.strategy_id);
        if let Err(publish_error) = publish_json(self.bus.as_ref(), key, &event).await {
            error!(%publish_error, "denial publish failed");
        }
    }

    /// Settle a terminal execution into positions and the capital ledger.
    /// Idempotent: replays with the same `exchange_order_id` find the journal
    /// already settled and change nothing.
    pub fn handle_executed(&mut self, event: &TradeExecuted) {
        let Some(trade) = self
            .store
            .trade_by_client_order_id(&event.client_order_id)
            .unwrap_or(None)
        else {
            warn!(order = %event.exchange_order_id, "trade_executed for unknown journal entry");
            return;
        };
        if trade.settled_at.is_some() {
            return;
        }

        let fill_amount = event.fill.filled_amount;
        let fill_price = event.fill.avg_fill_price.unwrap_or_default();
        let fee = event.fill.fee.unwrap_or_default();

        // Position update first computes realised PnL, then the write-once
        // marker claims the settlement before anything is persisted.
        let mut position = match self
            .store
            .position(event.strategy_id, event.exchange, &event.symbol)
        {
            Ok(Some(position)) => position,
            Ok(None) => stratus_model::portfolio::Position::flat(
                event.strategy_id,
                event.exchange,
                event.symbol.clone(),
            ),
            Err(store_error) => {
                error!(%store_error, "position read failed; settlement deferred to sweep");
                return;
            }
        };
        let realized = if fill_amount.is_zero() {
            Decimal::ZERO
        } else {
            position.apply_fill(event.side.sign() * fill_amount, fill_price)
        };

        match self.store.mark_trade_settled(&event.client_order_id, realized) {
            Ok(true) => {}
            Ok(false) => return,
            Err(store_error) => {
                error!(%store_error, "settlement marker failed");
                return;
            }
        }

        if !fill_amount.is_zero() {
            if let Err(store_error) = self.store.upsert_position(&position) {
                error!(%store_error, "position upsert failed");
            }
        }

        let reservation_id = event.reservation_id.or(trade.reservation_id);
        if let Some(reservation_id) = reservation_id {
            let value = fill_amount * fill_price;
            let cash_delta = match event.side {
                Side::Buy => -(value + fee),
                Side::Sell => value - fee,
            };
            match self.store.settle_capital(reservation_id, cash_delta) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(%reservation_id, "reservation already settled")
                }
                Err(store_error) => error!(%store_error, "capital settlement failed"),
            }
        }

        info!(
            order = %event.exchange_order_id,
            filled = %fill_amount,
            %realized,
            "execution settled"
        );
    }

    /// A failed order releases its reservation untouched; positions never
    /// change.
    pub fn handle_failed(&mut self, event: &TradeFailed) {
        let client_order_id = ClientOrderId::from(event.proposal_id);
        if let Ok(Some(trade)) = self.store.trade_by_client_order_id(&client_order_id) {
            if trade.settled_at.is_some() {
                return;
            }
            let _ = self
                .store
                .mark_trade_settled(&client_order_id, Decimal::ZERO);
        }
        if let Some(reservation_id) = event.reservation_id {
            match self.store.release_capital(reservation_id) {
                Ok(Some(reservation)) => {
                    info!(%reservation_id, amount = %reservation.amount, "reservation released after failure");
                }
                Ok(None) => {}
                Err(store_error) => error!(%store_error, "reservation release failed"),
            }
        }
    }

    /// Investigate reservations older than the timeout: settle from the
    /// journal when the terminal event was lost, release orphans, and flag
    /// still-working orders for reconciliation.
    pub async fn sweep_reservations(&mut self) -> Result<(), CapitalError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.reservation_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));

        for reservation in self.store.open_reservations(None)? {
            if reservation.created_at > cutoff {
                continue;
            }
            match self.store.trade_by_reservation_id(reservation.id)? {
                None => {
                    warn!(
                        reservation = %reservation.id,
                        "aged reservation has no journal entry; releasing"
                    );
                    self.store.release_capital(reservation.id)?;
                    let alert = Alert::warning(
                        "capital.reservation_orphaned",
                        format!("reservation {} released without a journal entry", reservation.id),
                    );
                    let _ = publish_json(
                        self.bus.as_ref(),
                        keys::alert("capital.reservation_orphaned"),
                        &alert,
                    )
                    .await;
                }
                Some(trade) if trade.status.is_terminal() => {
                    // Terminal but still reserved: the event never arrived.
                    self.settle_from_journal(&trade, reservation.id);
                }
                Some(trade) => {
                    // Still working on the venue side. Reconciliation owns it.
                    let alert = Alert::warning(
                        "capital.reservation_stale",
                        format!(
                            "order {} still working after {}s; deferring to reconciliation",
                            trade.client_order_id,
                            self.config.reservation_timeout.as_secs()
                        ),
                    );
                    let _ = publish_json(
                        self.bus.as_ref(),
                        keys::alert("capital.reservation_stale"),
                        &alert,
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Settlement fallback driven by the journal instead of a bus event.
    fn settle_from_journal(&mut self, trade: &TradeRecord, reservation_id: ReservationId) {
        let event = TradeExecuted {
            proposal_id: stratus_model::proposal::ProposalId(uuid_from_cid(&trade.client_order_id)),
            reservation_id: Some(reservation_id),
            strategy_id: trade.strategy_id,
            exchange: trade.exchange,
            symbol: trade.symbol.clone(),
            side: trade.side,
            exchange_order_id: trade
                .exchange_order_id
                .clone()
                .unwrap_or_else(|| stratus_model::order::ExchangeOrderId::new("unknown")),
            client_order_id: trade.client_order_id.clone(),
            status: trade.status,
            fill: stratus_model::order::FillInfo {
                filled_amount: trade.filled_amount,
                avg_fill_price: trade.avg_fill_price,
                fee: trade.fee,
            },
            time: Utc::now(),
        };
        info!(order = %event.client_order_id, "settling from journal after missed event");
        self.handle_executed(&event);
    }
}

fn uuid_from_cid(cid: &ClientOrderId) -> uuid::Uuid {
    uuid::Uuid::parse_str(cid.0.as_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratus_bus::memory::InMemoryBus;
    use stratus_model::{
        order::{ExchangeOrderId, FillInfo, TradeStatus},
        portfolio::{PortfolioId, RuleKind},
        proposal::ProposalId,
        strategy::StrategyId,
    };
    use stratus_store::trade::NewTrade;

    struct Fixture {
        bus: Arc<InMemoryBus>,
        store: Store,
        manager: CapitalManager,
        portfolio_id: PortfolioId,
        strategy_id: StrategyId,
    }

    fn fixture(risk_pct: Decimal) -> Fixture {
        let bus = Arc::new(InMemoryBus::default());
        let store = Store::open_in_memory().unwrap();
        let portfolio = store
            .create_portfolio("P1", None, "USDT", dec!(10000))
            .unwrap();
        store
            .add_rule(portfolio.id, &RuleKind::MaxPositionSizePct { pct: dec!(10) })
            .unwrap();
        let strategy = store
            .create_strategy(
                "S1",
                "sma_cross",
                ExchangeId::Mock,
                &Symbol::new("BTC/USDT"),
                serde_json::json!({}),
                Some(&PositionSizing::FixedFractional { risk_pct }),
                portfolio.id,
            )
            .unwrap();
        let manager = CapitalManager::new(
            bus.clone() as Arc<dyn MessageBus>,
            store.clone(),
            CapitalManagerConfig::default(),
        );
        Fixture {
            bus,
            store,
            manager,
            portfolio_id: portfolio.id,
            strategy_id: strategy.id,
        }
    }

    fn proposal(strategy_id: StrategyId) -> Proposal {
        Proposal {
            proposal_id: ProposalId::random(),
            strategy_id,
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Buy,
            signal_price: dec!(50000),
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: None,
            confidence: 0.9,
            params: serde_json::Value::Null,
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_oversized_proposal_denied_by_position_size_rule() {
        // risk 2% against a 1 000 stop distance sizes 0.2 BTC - a 10 000
        // notional that is 100% of capital. The 10% rule must fire.
        let mut fixture = fixture(dec!(0.02));
        let mut denials = fixture
            .bus
            .subscribe(
                RoutingPattern::new("events.capital.denied.#"),
                "test",
            )
            .await
            .unwrap();

        fixture
            .manager
            .handle_proposal(proposal(fixture.strategy_id))
            .await;

        let denial: CapitalDenied = denials.recv().await.unwrap().payload_as().unwrap();
        assert_eq!(denial.reason, "MAX_POSITION_SIZE_PCT");
        // Nothing was reserved.
        assert!(fixture.store.open_reservations(None).unwrap().is_empty());
        assert_eq!(
            fixture
                .store
                .portfolio(fixture.portfolio_id)
                .unwrap()
                .available_capital,
            dec!(10000)
        );
    }

    #[tokio::test]
    async fn test_in_limit_proposal_reserves_and_emits_command() {
        // risk 0.2%: 0.02 BTC, 1 000 notional - exactly the 10% cap.
        let mut fixture = fixture(dec!(0.002));
        let mut commands = fixture
            .bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();

        fixture
            .manager
            .handle_proposal(proposal(fixture.strategy_id))
            .await;

        let delivery = commands.recv().await.unwrap();
        let command: ExecuteTrade = delivery.payload_as().unwrap();
        delivery.ack().await;
        assert_eq!(command.order.amount, dec!(0.02));

        let portfolio = fixture.store.portfolio(fixture.portfolio_id).unwrap();
        assert_eq!(portfolio.available_capital, dec!(9000));
        let reservations = fixture.store.open_reservations(None).unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].amount, dec!(1000));
        assert_eq!(reservations[0].id, command.reservation_id);
    }

    /// Drive the approved command through a synthetic fill and settle it.
    fn executed_event(command: &ExecuteTrade, fill_price: Decimal) -> TradeExecuted {
        TradeExecuted {
            proposal_id: command.proposal_id,
            reservation_id: Some(command.reservation_id),
            strategy_id: command.order.strategy_id,
            exchange: command.order.exchange,
            symbol: command.order.symbol.clone(),
            side: command.order.side,
            exchange_order_id: ExchangeOrderId::new("mock-1"),
            client_order_id: ClientOrderId::from(command.proposal_id),
            status: TradeStatus::Filled,
            fill: FillInfo {
                filled_amount: command.order.amount,
                avg_fill_price: Some(fill_price),
                fee: None,
            },
            time: Utc::now(),
        }
    }

    fn journal_fill(store: &Store, command: &ExecuteTrade, fill_price: Decimal) {
        let cid = ClientOrderId::from(command.proposal_id);
        store
            .save_trade(&NewTrade {
                strategy_id: command.order.strategy_id,
                exchange: command.order.exchange,
                symbol: command.order.symbol.clone(),
                client_order_id: cid.clone(),
                exchange_order_id: Some(ExchangeOrderId::new("mock-1")),
                reservation_id: Some(command.reservation_id),
                kind: command.order.kind,
                side: command.order.side,
                amount: command.order.amount,
                price: None,
                status: TradeStatus::Pending,
            })
            .unwrap();
        store
            .update_trade_status(
                &cid,
                TradeStatus::Filled,
                Some(&FillInfo {
                    filled_amount: command.order.amount,
                    avg_fill_price: Some(fill_price),
                    fee: None,
                }),
                None,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_settlement_opens_position_and_replay_is_idempotent() {
        let mut fixture = fixture(dec!(0.002));
        let mut commands = fixture
            .bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();
        fixture
            .manager
            .handle_proposal(proposal(fixture.strategy_id))
            .await;
        let command: ExecuteTrade = commands.recv().await.unwrap().payload_as().unwrap();

        journal_fill(&fixture.store, &command, dec!(50010));
        let event = executed_event(&command, dec!(50010));
        fixture.manager.handle_executed(&event);

        let position = fixture
            .store
            .position(fixture.strategy_id, ExchangeId::Mock, &Symbol::new("BTC/USDT"))
            .unwrap()
            .unwrap();
        assert_eq!(position.entry_price, dec!(50010));
        assert_eq!(position.current_size, dec!(0.02));
        assert!(position.is_open);

        let portfolio = fixture.store.portfolio(fixture.portfolio_id).unwrap();
        // Cash moved into the position: 10 000 - 0.02 x 50 010 = 8 999.8,
        // reservation gone, ledger invariant restored.
        assert_eq!(portfolio.available_capital, dec!(8999.8));
        assert_eq!(portfolio.total_capital, dec!(8999.8));
        assert!(fixture.store.open_reservations(None).unwrap().is_empty());

        // Replaying the same exchange_order_id changes nothing.
        fixture.manager.handle_executed(&event);
        let replayed = fixture
            .store
            .position(fixture.strategy_id, ExchangeId::Mock, &Symbol::new("BTC/USDT"))
            .unwrap()
            .unwrap();
        assert_eq!(replayed.current_size, dec!(0.02));
        assert_eq!(
            fixture.store.portfolio(fixture.portfolio_id).unwrap().total_capital,
            dec!(8999.8)
        );
    }

    #[tokio::test]
    async fn test_failed_trade_releases_reservation_untouched() {
        let mut fixture = fixture(dec!(0.002));
        let mut commands = fixture
            .bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();
        fixture
            .manager
            .handle_proposal(proposal(fixture.strategy_id))
            .await;
        let command: ExecuteTrade = commands.recv().await.unwrap().payload_as().unwrap();

        fixture.manager.handle_failed(&TradeFailed {
            proposal_id: command.proposal_id,
            reservation_id: Some(command.reservation_id),
            strategy_id: command.order.strategy_id,
            exchange: command.order.exchange,
            symbol: command.order.symbol.clone(),
            side: command.order.side,
            kind: stratus_model::error::ErrorKind::ExchangePermanent,
            reason: "insufficient funds".to_string(),
            time: Utc::now(),
        });

        let portfolio = fixture.store.portfolio(fixture.portfolio_id).unwrap();
        assert_eq!(portfolio.available_capital, dec!(10000));
        assert_eq!(portfolio.total_capital, dec!(10000));
        assert!(fixture
            .store
            .position(fixture.strategy_id, ExchangeId::Mock, &Symbol::new("BTC/USDT"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sweeper_settles_missed_terminal_event() {
        let mut fixture = fixture(dec!(0.002));
        fixture.manager.config.reservation_timeout = Duration::ZERO;
        let mut commands = fixture
            .bus
            .subscribe(RoutingPattern::new("commands.execute_trade"), "connector")
            .await
            .unwrap();
        fixture
            .manager
            .handle_proposal(proposal(fixture.strategy_id))
            .await;
        let command: ExecuteTrade = commands.recv().await.unwrap().payload_as().unwrap();

        // The fill landed in the journal, but the event never arrived.
        journal_fill(&fixture.store, &command, dec!(50000));
        fixture.manager.sweep_reservations().await.unwrap();

        assert!(fixture.store.open_reservations(None).unwrap().is_empty());
        let position = fixture
            .store
            .position(fixture.strategy_id, ExchangeId::Mock, &Symbol::new("BTC/USDT"))
            .unwrap()
            .unwrap();
        assert_eq!(position.current_size, dec!(0.02));
    }
}
