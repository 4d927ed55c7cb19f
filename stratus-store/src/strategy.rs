use crate::{error::StoreError, sql, Store};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use smol_str::SmolStr;
use stratus_model::{
    instrument::Symbol,
    portfolio::{Portfolio, PortfolioId},
    strategy::{PositionSizing, StrategyId, StrategyRecord},
};

fn strategy_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, String, Option<String>, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_strategy(
    (id, name, strategy_type, exchange, symbol, parameters, position_sizing, is_active): (
        i64,
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        bool,
    ),
) -> Result<StrategyRecord, StoreError> {
    Ok(StrategyRecord {
        id: StrategyId(id),
        name: SmolStr::new(name),
        strategy_type: SmolStr::new(strategy_type),
        exchange: sql::exchange(&exchange)?,
        symbol: Symbol::new(symbol),
        parameters: serde_json::from_str(&parameters)
            .map_err(|error| StoreError::Corrupt(format!("strategy parameters: {error}")))?,
        position_sizing: position_sizing
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|error| StoreError::Corrupt(format!("position_sizing: {error}")))?,
        is_active,
    })
}

const STRATEGY_COLS: &str =
    "id, name, strategy_type, exchange, symbol, parameters, position_sizing, is_active";

impl Store {
    /// Create a strategy row mapped to `portfolio_id`.
    pub fn create_strategy(
        &self,
        name: &str,
        strategy_type: &str,
        exchange: stratus_model::exchange::ExchangeId,
        symbol: &Symbol,
        parameters: serde_json::Value,
        position_sizing: Option<&PositionSizing>,
        portfolio_id: PortfolioId,
    ) -> Result<StrategyRecord, StoreError> {
        let parameters_text = parameters.to_string();
        let sizing_text = position_sizing
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO strategies (name, strategy_type, exchange, symbol, parameters, position_sizing, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    name,
                    strategy_type,
                    exchange.as_str(),
                    symbol.as_ref(),
                    parameters_text,
                    sizing_text,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO strategy_portfolio_map (strategy_id, portfolio_id) VALUES (?1, ?2)",
                params![id, portfolio_id.0],
            )?;
            tx.commit()?;

            Ok(StrategyRecord {
                id: StrategyId(id),
                name: SmolStr::new(name),
                strategy_type: SmolStr::new(strategy_type),
                exchange,
                symbol: symbol.clone(),
                parameters,
                position_sizing: position_sizing.cloned(),
                is_active: false,
            })
        })
    }

    pub fn strategy(&self, id: StrategyId) -> Result<StrategyRecord, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {STRATEGY_COLS} FROM strategies WHERE id = ?1"),
                params![id.0],
                strategy_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("strategy", id))
            .and_then(into_strategy)
        })
    }

    /// All strategies, or only the active ones. The `manual` pseudo-strategy
    /// is excluded - it exists to carry adopted positions, not to run.
    pub fn strategies(&self, active_only: bool) -> Result<Vec<StrategyRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STRATEGY_COLS} FROM strategies
                 WHERE id != 0 AND (?1 = 0 OR is_active = 1) ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![active_only as i64], strategy_from_row)?;
            rows.map(|row| into_strategy(row?)).collect()
        })
    }

    pub fn set_strategy_active(&self, id: StrategyId, active: bool) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE strategies SET is_active = ?1 WHERE id = ?2",
                params![active as i64, id.0],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("strategy", id));
            }
            Ok(())
        })
    }

    /// The portfolio a strategy draws capital from, via
    /// `strategy_portfolio_map`.
    pub fn portfolio_for_strategy(
        &self,
        strategy_id: StrategyId,
    ) -> Result<Option<Portfolio>, StoreError> {
        let portfolio_id: Option<i64> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT portfolio_id FROM strategy_portfolio_map WHERE strategy_id = ?1",
                    params![strategy_id.0],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match portfolio_id {
            Some(id) => self.portfolio(PortfolioId(id)).map(Some),
            None => Ok(None),
        }
    }

    /// Strategies mapped to `portfolio_id`.
    pub fn strategies_in_portfolio(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Vec<StrategyId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strategy_id FROM strategy_portfolio_map WHERE portfolio_id = ?1",
            )?;
            let rows = stmt.query_map(params![portfolio_id.0], |row| row.get::<_, i64>(0))?;
            rows.map(|id| Ok(StrategyId(id?))).collect()
        })
    }

    /// Persist a worker's warm-restart snapshot.
    pub fn save_snapshot(
        &self,
        strategy_id: StrategyId,
        state: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO strategy_snapshots (strategy_id, state, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (strategy_id) DO UPDATE SET state = ?2, updated_at = ?3",
                params![strategy_id.0, state.to_string(), sql::time_sql(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn load_snapshot(
        &self,
        strategy_id: StrategyId,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let state: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT state FROM strategy_snapshots WHERE strategy_id = ?1",
                    params![strategy_id.0],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        state
            .map(|state| {
                serde_json::from_str(&state)
                    .map_err(|error| StoreError::Corrupt(format!("snapshot: {error}")))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratus_model::exchange::ExchangeId;

    fn fixture(store: &Store) -> (Portfolio, StrategyRecord) {
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(10000))
            .unwrap();
        let strategy = store
            .create_strategy(
                "sma-btc",
                "sma_cross",
                ExchangeId::Mock,
                &Symbol::new("BTC/USDT"),
                serde_json::json!({"fast": 9, "slow": 21}),
                Some(&PositionSizing::FixedFractional { risk_pct: dec!(0.02) }),
                portfolio.id,
            )
            .unwrap();
        (portfolio, strategy)
    }

    #[test]
    fn test_strategy_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let (_, strategy) = fixture(&store);
        let fetched = store.strategy(strategy.id).unwrap();
        assert_eq!(fetched, strategy);
    }

    #[test]
    fn test_active_filter_and_manual_exclusion() {
        let store = Store::open_in_memory().unwrap();
        let (_, strategy) = fixture(&store);

        assert!(store.strategies(true).unwrap().is_empty());
        store.set_strategy_active(strategy.id, true).unwrap();
        let active = store.strategies(true).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active.iter().all(|s| s.id != StrategyId::MANUAL));
    }

    #[test]
    fn test_portfolio_for_strategy() {
        let store = Store::open_in_memory().unwrap();
        let (portfolio, strategy) = fixture(&store);
        let mapped = store.portfolio_for_strategy(strategy.id).unwrap().unwrap();
        assert_eq!(mapped.id, portfolio.id);
        assert!(store
            .portfolio_for_strategy(StrategyId(999))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_snapshot_round_trip_and_overwrite() {
        let store = Store::open_in_memory().unwrap();
        let (_, strategy) = fixture(&store);

        assert!(store.load_snapshot(strategy.id).unwrap().is_none());
        store
            .save_snapshot(strategy.id, &serde_json::json!({"bars": 12}))
            .unwrap();
        store
            .save_snapshot(strategy.id, &serde_json::json!({"bars": 13}))
            .unwrap();
        let snapshot = store.load_snapshot(strategy.id).unwrap().unwrap();
        assert_eq!(snapshot["bars"], 13);
    }
}
