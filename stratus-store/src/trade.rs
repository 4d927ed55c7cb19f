use crate::{error::StoreError, sql, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use stratus_model::{
    exchange::ExchangeId,
    instrument::Symbol,
    order::{
        ClientOrderId, ExchangeOrderId, FillInfo, OrderKind, TradeId, TradeRecord, TradeStatus,
    },
    portfolio::{PortfolioId, ReservationId},
    strategy::StrategyId,
    Side,
};

/// A journal row about to be written, before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub reservation_id: Option<ReservationId>,
    pub kind: OrderKind,
    pub side: Side,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub status: TradeStatus,
}

const TRADE_COLS: &str = "id, strategy_id, exchange, symbol, exchange_order_id, client_order_id, \
     reservation_id, kind, side, amount, price, filled_amount, avg_fill_price, fee, realized_pnl, \
     status, settled_at, created_at, updated_at";

type TradeRow = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
    ))
}

fn into_trade(row: TradeRow) -> Result<TradeRecord, StoreError> {
    let (
        id,
        strategy_id,
        exchange,
        symbol,
        exchange_order_id,
        client_order_id,
        reservation_id,
        kind,
        side,
        amount,
        price,
        filled_amount,
        avg_fill_price,
        fee,
        realized_pnl,
        status,
        settled_at,
        created_at,
        updated_at,
    ) = row;
    Ok(TradeRecord {
        id: TradeId(id),
        strategy_id: StrategyId(strategy_id),
        exchange: sql::exchange(&exchange)?,
        symbol: Symbol::new(symbol),
        exchange_order_id: exchange_order_id.map(ExchangeOrderId::new),
        client_order_id: ClientOrderId::new(client_order_id),
        reservation_id: reservation_id.map(ReservationId),
        kind: sql::order_kind(&kind)?,
        side: sql::side(&side)?,
        amount: sql::decimal(&amount)?,
        price: sql::decimal_opt(price)?,
        filled_amount: sql::decimal(&filled_amount)?,
        avg_fill_price: sql::decimal_opt(avg_fill_price)?,
        fee: sql::decimal_opt(fee)?,
        realized_pnl: sql::decimal_opt(realized_pnl)?,
        status: sql::status(&status)?,
        settled_at: settled_at.as_deref().map(sql::time).transpose()?,
        created_at: sql::time(&created_at)?,
        updated_at: sql::time(&updated_at)?,
    })
}

impl Store {
    /// Append a trade to the journal.
    ///
    /// Idempotent on `client_order_id`: re-saving an already-journaled order
    /// returns the existing row untouched.
    pub fn save_trade(&self, trade: &NewTrade) -> Result<TradeRecord, StoreError> {
        let now = sql::time_sql(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trades (strategy_id, exchange, symbol, exchange_order_id, client_order_id,
                                     reservation_id, kind, side, amount, price, filled_amount, status,
                                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, '0', ?11, ?12, ?12)
                 ON CONFLICT (client_order_id) DO NOTHING",
                params![
                    trade.strategy_id.0,
                    trade.exchange.as_str(),
                    trade.symbol.as_ref(),
                    trade.exchange_order_id.as_ref().map(|id| id.0.as_str()),
                    trade.client_order_id.0.as_str(),
                    trade.reservation_id.map(|id| id.0),
                    sql::order_kind_sql(trade.kind),
                    trade.side.as_str(),
                    trade.amount.to_string(),
                    trade.price.map(|price| price.to_string()),
                    sql::status_sql(trade.status),
                    now,
                ],
            )?;
            Ok(())
        })?;
        self.trade_by_client_order_id(&trade.client_order_id)?
            .ok_or_else(|| StoreError::not_found("trade", &trade.client_order_id.0))
    }

    /// Record the exchange-assigned order id once the exchange accepts.
    pub fn attach_exchange_order_id(
        &self,
        client_order_id: &ClientOrderId,
        exchange_order_id: &ExchangeOrderId,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE trades SET exchange_order_id = ?1, updated_at = ?2 WHERE client_order_id = ?3",
                params![
                    exchange_order_id.0.as_str(),
                    sql::time_sql(Utc::now()),
                    client_order_id.0.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Advance a journaled trade along the status machine.
    ///
    /// Returns `true` when the transition was applied, `false` for an
    /// idempotent replay of the current status. Backwards transitions are
    /// rejected with [`StoreError::InvalidTransition`].
    pub fn update_trade_status(
        &self,
        client_order_id: &ClientOrderId,
        new_status: TradeStatus,
        fill: Option<&FillInfo>,
        realized_pnl: Option<Decimal>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM trades WHERE client_order_id = ?1",
                    params![client_order_id.0.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(StoreError::not_found("trade", &client_order_id.0));
            };
            let current = sql::status(&current)?;

            if current == new_status && (current != TradeStatus::Partial) {
                // Idempotent replay of the same (usually terminal) status.
                return Ok(false);
            }
            if !current.can_transition_to(new_status) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: new_status,
                });
            }

            tx.execute(
                "UPDATE trades SET
                     status = ?1,
                     filled_amount = COALESCE(?2, filled_amount),
                     avg_fill_price = COALESCE(?3, avg_fill_price),
                     fee = COALESCE(?4, fee),
                     realized_pnl = COALESCE(?5, realized_pnl),
                     updated_at = ?6
                 WHERE client_order_id = ?7",
                params![
                    sql::status_sql(new_status),
                    fill.map(|fill| fill.filled_amount.to_string()),
                    fill.and_then(|fill| fill.avg_fill_price).map(|price| price.to_string()),
                    fill.and_then(|fill| fill.fee).map(|fee| fee.to_string()),
                    realized_pnl.map(|pnl| pnl.to_string()),
                    sql::time_sql(Utc::now()),
                    client_order_id.0.as_str(),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn trade_by_client_order_id(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<TradeRecord>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TRADE_COLS} FROM trades WHERE client_order_id = ?1"),
                params![client_order_id.0.as_str()],
                trade_from_row,
            )
            .optional()?
            .map(into_trade)
            .transpose()
        })
    }

    pub fn trade_by_reservation_id(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<TradeRecord>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TRADE_COLS} FROM trades WHERE reservation_id = ?1"),
                params![reservation_id.0],
                trade_from_row,
            )
            .optional()?
            .map(into_trade)
            .transpose()
        })
    }

    /// Claim settlement of a terminal trade, recording its realised PnL.
    ///
    /// Write-once: returns `true` only for the first caller; replayed events
    /// find `settled_at` already set and must not touch positions or capital
    /// again.
    pub fn mark_trade_settled(
        &self,
        client_order_id: &ClientOrderId,
        realized_pnl: Decimal,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE trades SET settled_at = ?1, realized_pnl = ?2, updated_at = ?1
                 WHERE client_order_id = ?3 AND settled_at IS NULL",
                params![
                    sql::time_sql(Utc::now()),
                    realized_pnl.to_string(),
                    client_order_id.0.as_str(),
                ],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn trade_by_exchange_order_id(
        &self,
        exchange_order_id: &ExchangeOrderId,
    ) -> Result<Option<TradeRecord>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TRADE_COLS} FROM trades WHERE exchange_order_id = ?1"),
                params![exchange_order_id.0.as_str()],
                trade_from_row,
            )
            .optional()?
            .map(into_trade)
            .transpose()
        })
    }

    /// Orders still working from the journal's point of view
    /// (`pending | submitted | open | partial`). The reconciliation read.
    pub fn get_open_orders(&self) -> Result<Vec<TradeRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades
                 WHERE status IN ('pending', 'submitted', 'open', 'partial') ORDER BY id"
            ))?;
            let rows = stmt.query_map([], trade_from_row)?;
            rows.map(|row| into_trade(row?)).collect()
        })
    }

    /// Most recent terminally-filled trades of a strategy, newest first.
    /// Feeds Kelly sizing.
    pub fn recent_closed_trades(
        &self,
        strategy_id: StrategyId,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades
                 WHERE strategy_id = ?1 AND status = 'filled'
                 ORDER BY updated_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![strategy_id.0, limit as i64], trade_from_row)?;
            rows.map(|row| into_trade(row?)).collect()
        })
    }

    /// Realised PnL of a portfolio's strategies over trades settled since
    /// `since`. Negative means the portfolio lost money in the window.
    pub fn realized_pnl_since(
        &self,
        portfolio_id: PortfolioId,
        since: DateTime<Utc>,
    ) -> Result<Decimal, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.realized_pnl FROM trades t
                 JOIN strategy_portfolio_map m ON m.strategy_id = t.strategy_id
                 WHERE m.portfolio_id = ?1 AND t.updated_at >= ?2 AND t.realized_pnl IS NOT NULL",
            )?;
            let rows = stmt.query_map(
                params![portfolio_id.0, sql::time_sql(since)],
                |row| row.get::<_, String>(0),
            )?;
            let mut total = Decimal::ZERO;
            for pnl in rows {
                total += sql::decimal(&pnl?)?;
            }
            Ok(total)
        })
    }
}
