use rust_decimal::Decimal;
use std::{collections::HashMap, sync::Arc};
use stratus_exchange::{client::ExecutionClient, error::ExchangeError};
use stratus_model::{
    event::{Alert, OrphanPolicy},
    exchange::ExchangeId,
    instrument::Symbol,
    order::{ClientOrderId, OrderKind, TradeRecord, TradeStatus},
    portfolio::Position,
    strategy::StrategyId,
    Side,
};
use stratus_store::{error::StoreError, trade::NewTrade, Store};
use tracing::{info, warn};

/// Outcome of one reconciliation pass. `alerts` are handed back to the caller
/// for publication - the reconciler itself never touches the bus.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Case A: orders open in the journal that the exchange had closed.
    pub finalized_fills: u32,
    /// Case C: orders open in the journal that the exchange never saw
    /// (or no longer reports).
    pub stale_canceled: u32,
    /// Case B, `adopt` policy: exchange positions synthesised into the
    /// journal under the `manual` pseudo-strategy.
    pub orphans_adopted: u32,
    /// Case B, `freeze` policy: orphans that halted trading.
    pub orphans_frozen: u32,
    /// Portfolios whose available capital needed repair.
    pub ledgers_repaired: u32,
    pub alerts: Vec<Alert>,
}

impl ReconcileReport {
    /// Total repairs performed. Zero on the second of two back-to-back runs
    /// against an unchanged exchange - reconciliation is idempotent.
    pub fn writes(&self) -> u32 {
        self.finalized_fills + self.stale_canceled + self.orphans_adopted + self.ledgers_repaired
    }

    /// Whether this pass requires trading to stay frozen.
    pub fn frozen(&self) -> bool {
        self.orphans_frozen > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error during reconciliation: {0}")]
    Store(#[from] StoreError),

    #[error("exchange {exchange} unreachable during reconciliation: {error}")]
    Exchange {
        exchange: ExchangeId,
        error: ExchangeError,
    },
}

/// The State Reconciliation Protocol: align the journal with exchange truth
/// after any restart, and periodically to catch missed events.
///
/// In-flight orders are never disturbed - only terminal mismatches are
/// repaired.
pub struct Reconciler {
    store: Store,
    clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>>,
    policy: OrphanPolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("exchanges", &self.clients.keys().collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        store: Store,
        clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>>,
        policy: OrphanPolicy,
    ) -> Self {
        Self {
            store,
            clients,
            policy,
        }
    }

    /// Run the full protocol across every configured exchange.
    pub async fn run(
        &self,
        policy_override: Option<OrphanPolicy>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let policy = policy_override.unwrap_or(self.policy);
        let mut report = ReconcileReport::default();

        for (exchange, client) in &self.clients {
            self.reconcile_exchange(*exchange, client.as_ref(), policy, &mut report)
                .await?;
        }

        // Step 4: reservation repair across the repaired state.
        let repaired = self.store.repair_available_capital()?;
        report.ledgers_repaired = repaired.len() as u32;
        for (portfolio, before, after) in repaired {
            report.alerts.push(Alert::warning(
                "reconcile.ledger",
                format!("portfolio {portfolio} available capital repaired {before} -> {after}"),
            ));
        }

        info!(
            finalized = report.finalized_fills,
            stale = report.stale_canceled,
            adopted = report.orphans_adopted,
            frozen = report.orphans_frozen,
            ledgers = report.ledgers_repaired,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    async fn reconcile_exchange(
        &self,
        exchange: ExchangeId,
        client: &dyn ExecutionClient,
        policy: OrphanPolicy,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let wrap = |error: ExchangeError| ReconcileError::Exchange { exchange, error };

        // Step 1: exchange truth.
        let exchange_positions = client.positions().await.map_err(wrap)?;
        let _balances = client.balances().await.map_err(wrap)?;

        // Step 2: journal state.
        let db_open_orders: Vec<TradeRecord> = self
            .store
            .get_open_orders()?
            .into_iter()
            .filter(|order| order.exchange == exchange)
            .collect();

        // Step 3, cases A and C: every journal-open order checked against the
        // venue by its idempotency key.
        for order in &db_open_orders {
            match client
                .fetch_order(&order.symbol, &order.client_order_id)
                .await
                .map_err(wrap)?
            {
                Some(snapshot) if snapshot.status.is_terminal() => {
                    self.finalize_order(order, snapshot.status, snapshot.filled_amount,
                        snapshot.avg_fill_price, snapshot.fee)?;
                    report.finalized_fills += 1;
                    report.alerts.push(Alert::warning(
                        "reconcile.missing_fill",
                        format!(
                            "order {} reached {} while we were away",
                            order.client_order_id, snapshot.status
                        ),
                    ));
                }
                Some(_) => {
                    // Still working on the venue: leave it alone.
                }
                None => {
                    self.finalize_order(order, TradeStatus::Canceled, Decimal::ZERO, None, None)?;
                    report.stale_canceled += 1;
                    report.alerts.push(Alert::warning(
                        "reconcile.stale_order",
                        format!("order {} absent from {exchange}; marked canceled", order.client_order_id),
                    ));
                }
            }
        }

        // Step 3, case B: exchange positions the journal knows nothing about.
        // Read after cases A/C so a just-finalized fill is not misread as an
        // orphan.
        let db_open_positions: Vec<Position> = self
            .store
            .get_open_positions()?
            .into_iter()
            .filter(|position| position.exchange == exchange)
            .collect();
        for exchange_position in &exchange_positions {
            let known = db_open_positions
                .iter()
                .any(|position| position.symbol == exchange_position.symbol);
            if known {
                continue;
            }
            report.alerts.push(Alert::critical(
                "reconcile.orphan",
                format!(
                    "{exchange} reports {} {} with no journal record (policy: {policy})",
                    exchange_position.amount, exchange_position.symbol
                ),
            ));
            match policy {
                OrphanPolicy::Adopt => {
                    self.adopt_position(exchange, exchange_position)?;
                    report.orphans_adopted += 1;
                }
                OrphanPolicy::Freeze => {
                    let flags = self.store.system_flags()?;
                    if !flags.trading_halted {
                        self.store.set_trading_halted(
                            true,
                            Some(&format!(
                                "orphan position {} on {exchange}",
                                exchange_position.symbol
                            )),
                        )?;
                    }
                    report.orphans_frozen += 1;
                }
            }
        }

        Ok(())
    }

    /// Drive a journal-open order to its exchange-observed terminal state,
    /// updating positions and releasing capital exactly as live settlement
    /// would have.
    fn finalize_order(
        &self,
        order: &TradeRecord,
        status: TradeStatus,
        filled_amount: Decimal,
        avg_fill_price: Option<Decimal>,
        fee: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let fill = stratus_model::order::FillInfo {
            filled_amount,
            avg_fill_price,
            fee,
        };
        self.store
            .update_trade_status(&order.client_order_id, status, Some(&fill), None)?;

        let mut position = self
            .store
            .position(order.strategy_id, order.exchange, &order.symbol)?
            .unwrap_or_else(|| {
                Position::flat(order.strategy_id, order.exchange, order.symbol.clone())
            });
        let fill_price = avg_fill_price.unwrap_or_default();
        let realized = if filled_amount.is_zero() {
            Decimal::ZERO
        } else {
            position.apply_fill(order.side.sign() * filled_amount, fill_price)
        };

        if !self
            .store
            .mark_trade_settled(&order.client_order_id, realized)?
        {
            return Ok(());
        }
        if !filled_amount.is_zero() {
            self.store.upsert_position(&position)?;
        }

        if let Some(reservation_id) = order.reservation_id {
            let value = filled_amount * fill_price;
            let fee = fee.unwrap_or_default();
            let cash_delta = match order.side {
                Side::Buy => -(value + fee),
                Side::Sell => value - fee,
            };
            self.store.settle_capital(reservation_id, cash_delta)?;
        }
        Ok(())
    }

    /// Case B `adopt`: journal a synthesised fill under the `manual`
    /// pseudo-strategy so the position exists, attributed and auditable.
    /// Adopted positions are never auto-closed.
    fn adopt_position(
        &self,
        exchange: ExchangeId,
        orphan: &stratus_exchange::client::ExchangePosition,
    ) -> Result<(), StoreError> {
        let side = if orphan.amount >= Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };
        let entry_price = orphan.entry_price.unwrap_or_default();
        let client_order_id = adoption_key(exchange, &orphan.symbol);

        let trade = self.store.save_trade(&NewTrade {
            strategy_id: StrategyId::MANUAL,
            exchange,
            symbol: orphan.symbol.clone(),
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            reservation_id: None,
            kind: OrderKind::Market,
            side,
            amount: orphan.amount.abs(),
            price: orphan.entry_price,
            status: TradeStatus::Pending,
        })?;
        if trade.status.is_terminal() {
            // Already adopted by an earlier pass.
            return Ok(());
        }

        self.store.update_trade_status(
            &client_order_id,
            TradeStatus::Filled,
            Some(&stratus_model::order::FillInfo {
                filled_amount: orphan.amount.abs(),
                avg_fill_price: orphan.entry_price,
                fee: None,
            }),
            None,
        )?;
        self.store
            .mark_trade_settled(&client_order_id, Decimal::ZERO)?;

        let mut position =
            Position::flat(StrategyId::MANUAL, exchange, orphan.symbol.clone());
        position.apply_fill(orphan.amount, entry_price);
        self.store.upsert_position(&position)?;

        warn!(
            symbol = %orphan.symbol,
            amount = %orphan.amount,
            "adopted orphan position under the manual strategy"
        );
        Ok(())
    }
}

fn adoption_key(exchange: ExchangeId, symbol: &Symbol) -> ClientOrderId {
    ClientOrderId::new(format!("adopt-{}-{}", exchange.as_str(), symbol))
}
