use crate::{error::StoreError, sql, Store};
use rusqlite::{params, OptionalExtension, Row};
use stratus_model::{
    exchange::ExchangeId,
    instrument::Symbol,
    portfolio::{PortfolioId, Position},
    strategy::StrategyId,
};

type PositionRow = (i64, String, String, String, String, String, String, bool, String);

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRow> {
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
    ))
}

fn into_position(row: PositionRow) -> Result<Position, StoreError> {
    let (
        strategy_id,
        exchange,
        symbol,
        entry_price,
        current_size,
        unrealized_pnl,
        realized_pnl,
        is_open,
        updated_at,
    ) = row;
    Ok(Position {
        strategy_id: StrategyId(strategy_id),
        exchange: sql::exchange(&exchange)?,
        symbol: Symbol::new(symbol),
        entry_price: sql::decimal(&entry_price)?,
        current_size: sql::decimal(&current_size)?,
        unrealized_pnl: sql::decimal(&unrealized_pnl)?,
        realized_pnl: sql::decimal(&realized_pnl)?,
        is_open,
        updated_at: sql::time(&updated_at)?,
    })
}

const POSITION_COLS: &str = "strategy_id, exchange, symbol, entry_price, current_size, \
     unrealized_pnl, realized_pnl, is_open, updated_at";

impl Store {
    /// Atomic replace keyed by (strategy, exchange, symbol).
    pub fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO positions (strategy_id, exchange, symbol, entry_price, current_size,
                                        unrealized_pnl, realized_pnl, is_open, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (strategy_id, exchange, symbol) DO UPDATE SET
                     entry_price = ?4, current_size = ?5, unrealized_pnl = ?6,
                     realized_pnl = ?7, is_open = ?8, updated_at = ?9",
                params![
                    position.strategy_id.0,
                    position.exchange.as_str(),
                    position.symbol.as_ref(),
                    position.entry_price.to_string(),
                    position.current_size.to_string(),
                    position.unrealized_pnl.to_string(),
                    position.realized_pnl.to_string(),
                    position.is_open,
                    sql::time_sql(position.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn position(
        &self,
        strategy_id: StrategyId,
        exchange: ExchangeId,
        symbol: &Symbol,
    ) -> Result<Option<Position>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {POSITION_COLS} FROM positions
                     WHERE strategy_id = ?1 AND exchange = ?2 AND symbol = ?3"
                ),
                params![strategy_id.0, exchange.as_str(), symbol.as_ref()],
                position_from_row,
            )
            .optional()?
            .map(into_position)
            .transpose()
        })
    }

    /// All open positions. The reconciliation read.
    pub fn get_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POSITION_COLS} FROM positions WHERE is_open = 1 ORDER BY strategy_id"
            ))?;
            let rows = stmt.query_map([], position_from_row)?;
            rows.map(|row| into_position(row?)).collect()
        })
    }

    /// Open positions held by strategies of `portfolio_id`.
    pub fn open_positions_for_portfolio(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Vec<Position>, StoreError> {
        self.with_conn(|conn| {
            let qualified_cols: String = POSITION_COLS
                .split(", ")
                .map(|col| format!("p.{col}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT {qualified_cols} FROM positions p
                 JOIN strategy_portfolio_map m ON m.strategy_id = p.strategy_id
                 WHERE p.is_open = 1 AND m.portfolio_id = ?1"
            ))?;
            let rows = stmt.query_map(params![portfolio_id.0], position_from_row)?;
            rows.map(|row| into_position(row?)).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_upsert_replaces_by_key() {
        let store = Store::open_in_memory().unwrap();
        let mut position =
            Position::flat(StrategyId(1), ExchangeId::Mock, Symbol::new("BTC/USDT"));
        position.apply_fill(dec!(0.5), dec!(100));
        store.upsert_position(&position).unwrap();

        position.apply_fill(dec!(0.5), dec!(110));
        store.upsert_position(&position).unwrap();

        let fetched = store
            .position(StrategyId(1), ExchangeId::Mock, &Symbol::new("BTC/USDT"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.current_size, dec!(1));
        assert_eq!(fetched.entry_price, dec!(105));
        assert_eq!(store.get_open_positions().unwrap().len(), 1);
    }

    #[test]
    fn test_closed_positions_not_listed_open() {
        let store = Store::open_in_memory().unwrap();
        let mut position =
            Position::flat(StrategyId(1), ExchangeId::Mock, Symbol::new("ETH/USDT"));
        position.apply_fill(dec!(1), dec!(2000));
        position.apply_fill(dec!(-1), dec!(2100));
        store.upsert_position(&position).unwrap();
        assert!(store.get_open_positions().unwrap().is_empty());
    }
}
