use crate::{error::StoreError, sql, Store};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use stratus_model::{
    portfolio::{Portfolio, PortfolioId, Reservation, ReservationId, RuleKind},
    strategy::StrategyId,
};
use tracing::warn;

fn portfolio_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, Option<i64>, String, String, String, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_portfolio(
    (id, name, parent_id, base_currency, total, available, is_active): (
        i64,
        String,
        Option<i64>,
        String,
        String,
        String,
        bool,
    ),
) -> Result<Portfolio, StoreError> {
    Ok(Portfolio {
        id: PortfolioId(id),
        name: SmolStr::new(name),
        parent_id: parent_id.map(PortfolioId),
        base_currency: SmolStr::new(base_currency),
        total_capital: sql::decimal(&total)?,
        available_capital: sql::decimal(&available)?,
        is_active,
    })
}

const PORTFOLIO_COLS: &str =
    "id, name, parent_id, base_currency, total_capital, available_capital, is_active";

impl Store {
    /// Create a portfolio with `available_capital` starting equal to
    /// `total_capital`.
    ///
    /// Rejects unknown parents and children whose combined `total_capital`
    /// would exceed the parent's.
    pub fn create_portfolio(
        &self,
        name: &str,
        parent_id: Option<PortfolioId>,
        base_currency: &str,
        total_capital: Decimal,
    ) -> Result<Portfolio, StoreError> {
        if total_capital < Decimal::ZERO {
            return Err(StoreError::Hierarchy("negative total_capital".into()));
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            if let Some(parent) = parent_id {
                let parent_total: Option<String> = tx
                    .query_row(
                        "SELECT total_capital FROM portfolios WHERE id = ?1",
                        params![parent.0],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(parent_total) = parent_total else {
                    return Err(StoreError::not_found("portfolio", parent));
                };
                let parent_total = sql::decimal(&parent_total)?;

                let mut children_total = Decimal::ZERO;
                let mut stmt =
                    tx.prepare("SELECT total_capital FROM portfolios WHERE parent_id = ?1")?;
                let rows = stmt.query_map(params![parent.0], |row| row.get::<_, String>(0))?;
                for total in rows {
                    children_total += sql::decimal(&total?)?;
                }
                drop(stmt);

                if children_total + total_capital > parent_total {
                    return Err(StoreError::Hierarchy(format!(
                        "children capital {} would exceed parent total {parent_total}",
                        children_total + total_capital
                    )));
                }
            }

            tx.execute(
                "INSERT INTO portfolios (name, parent_id, base_currency, total_capital, available_capital, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    name,
                    parent_id.map(|id| id.0),
                    base_currency,
                    total_capital.to_string(),
                    total_capital.to_string(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(Portfolio {
                id: PortfolioId(id),
                name: SmolStr::new(name),
                parent_id,
                base_currency: SmolStr::new(base_currency),
                total_capital,
                available_capital: total_capital,
                is_active: true,
            })
        })
    }

    pub fn portfolio(&self, id: PortfolioId) -> Result<Portfolio, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PORTFOLIO_COLS} FROM portfolios WHERE id = ?1"),
                params![id.0],
                portfolio_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("portfolio", id))
            .and_then(into_portfolio)
        })
    }

    pub fn portfolios(&self) -> Result<Vec<Portfolio>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {PORTFOLIO_COLS} FROM portfolios ORDER BY id"))?;
            let rows = stmt.query_map([], portfolio_from_row)?;
            rows.map(|row| into_portfolio(row?)).collect()
        })
    }

    /// Attach a rule to a portfolio.
    pub fn add_rule(&self, portfolio_id: PortfolioId, rule: &RuleKind) -> Result<(), StoreError> {
        let value = serde_json::to_string(rule)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO portfolio_rules (portfolio_id, rule_type, rule_value) VALUES (?1, ?2, ?3)",
                params![portfolio_id.0, rule.name(), value],
            )?;
            Ok(())
        })
    }

    /// The active ruleset of a portfolio, in insertion order.
    pub fn rules(&self, portfolio_id: PortfolioId) -> Result<Vec<RuleKind>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rule_value FROM portfolio_rules WHERE portfolio_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![portfolio_id.0], |row| row.get::<_, String>(0))?;
            rows.map(|value| {
                serde_json::from_str(&value?)
                    .map_err(|error| StoreError::Corrupt(format!("rule_value: {error}")))
            })
            .collect()
        })
    }

    /// Atomically earmark `amount` of the portfolio's available capital.
    ///
    /// A request exactly equal to the available balance is accepted; anything
    /// above it is [`StoreError::InsufficientCapital`].
    pub fn reserve_capital(
        &self,
        portfolio_id: PortfolioId,
        strategy_id: StrategyId,
        amount: Decimal,
    ) -> Result<Reservation, StoreError> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::Hierarchy("non-positive reservation".into()));
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let available: Option<String> = tx
                .query_row(
                    "SELECT available_capital FROM portfolios WHERE id = ?1",
                    params![portfolio_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(available) = available else {
                return Err(StoreError::not_found("portfolio", portfolio_id));
            };
            let available = sql::decimal(&available)?;

            if amount > available {
                return Err(StoreError::InsufficientCapital {
                    requested: amount,
                    available,
                });
            }

            let created_at = Utc::now();
            tx.execute(
                "UPDATE portfolios SET available_capital = ?1 WHERE id = ?2",
                params![(available - amount).to_string(), portfolio_id.0],
            )?;
            tx.execute(
                "INSERT INTO reservations (portfolio_id, strategy_id, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    portfolio_id.0,
                    strategy_id.0,
                    amount.to_string(),
                    sql::time_sql(created_at),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(Reservation {
                id: ReservationId(id),
                portfolio_id,
                strategy_id,
                amount,
                created_at,
            })
        })
    }

    /// Release a reservation, returning its full amount to available capital.
    ///
    /// Idempotent: releasing an unknown (already released) reservation is a
    /// no-op returning `None`.
    pub fn release_capital(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        self.settle_capital(reservation_id, Decimal::ZERO)
    }

    /// Settle a reservation against exchange truth: the reserved amount is
    /// returned to available capital and `cash_delta` is applied to both
    /// total and available (negative for a buy's cost, positive for a sell's
    /// proceeds).
    ///
    /// Idempotent on already-settled reservations.
    pub fn settle_capital(
        &self,
        reservation_id: ReservationId,
        cash_delta: Decimal,
    ) -> Result<Option<Reservation>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let row: Option<(i64, i64, String, String)> = tx
                .query_row(
                    "SELECT portfolio_id, strategy_id, amount, created_at
                     FROM reservations WHERE id = ?1",
                    params![reservation_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((portfolio_id, strategy_id, amount, created_at)) = row else {
                return Ok(None);
            };
            let amount = sql::decimal(&amount)?;

            let (total, available): (String, String) = tx.query_row(
                "SELECT total_capital, available_capital FROM portfolios WHERE id = ?1",
                params![portfolio_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let new_total = sql::decimal(&total)? + cash_delta;
            let new_available = sql::decimal(&available)? + amount + cash_delta;

            if new_available < Decimal::ZERO || new_available > new_total {
                return Err(StoreError::Corrupt(format!(
                    "ledger drift settling reservation {reservation_id}: available {new_available}, total {new_total}"
                )));
            }

            tx.execute(
                "UPDATE portfolios SET total_capital = ?1, available_capital = ?2 WHERE id = ?3",
                params![new_total.to_string(), new_available.to_string(), portfolio_id],
            )?;
            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![reservation_id.0],
            )?;
            tx.commit()?;

            Ok(Some(Reservation {
                id: reservation_id,
                portfolio_id: PortfolioId(portfolio_id),
                strategy_id: StrategyId(strategy_id),
                amount,
                created_at: sql::time(&created_at)?,
            }))
        })
    }

    /// Open reservations, optionally filtered by portfolio.
    pub fn open_reservations(
        &self,
        portfolio_id: Option<PortfolioId>,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, portfolio_id, strategy_id, amount, created_at FROM reservations
                 WHERE (?1 IS NULL OR portfolio_id = ?1) ORDER BY id",
            )?;
            let rows = stmt.query_map(params![portfolio_id.map(|id| id.0)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            rows.map(|row| {
                let (id, portfolio_id, strategy_id, amount, created_at) = row?;
                Ok(Reservation {
                    id: ReservationId(id),
                    portfolio_id: PortfolioId(portfolio_id),
                    strategy_id: StrategyId(strategy_id),
                    amount: sql::decimal(&amount)?,
                    created_at: sql::time(&created_at)?,
                })
            })
            .collect()
        })
    }

    /// Recompute `available = total - sum(open reservations)` for every
    /// portfolio, fixing any drift. Returns `(portfolio, before, after)` for
    /// each repaired row.
    pub fn repair_available_capital(
        &self,
    ) -> Result<Vec<(PortfolioId, Decimal, Decimal)>, StoreError> {
        let portfolios = self.portfolios()?;
        let mut repaired = Vec::new();

        for portfolio in portfolios {
            let reserved: Decimal = self
                .open_reservations(Some(portfolio.id))?
                .iter()
                .map(|reservation| reservation.amount)
                .sum();
            let expected = portfolio.total_capital - reserved;
            if expected != portfolio.available_capital {
                warn!(
                    portfolio = %portfolio.id,
                    actual = %portfolio.available_capital,
                    %expected,
                    "repairing available_capital drift"
                );
                self.with_conn(|conn| {
                    conn.execute(
                        "UPDATE portfolios SET available_capital = ?1 WHERE id = ?2",
                        params![expected.to_string(), portfolio.id.0],
                    )?;
                    Ok(())
                })?;
                repaired.push((portfolio.id, portfolio.available_capital, expected));
            }
        }

        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_fetch_portfolio() {
        let store = store();
        let created = store
            .create_portfolio("main", None, "USDT", dec!(10000))
            .unwrap();
        let fetched = store.portfolio(created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.available_capital, dec!(10000));
    }

    #[test]
    fn test_child_capital_cannot_exceed_parent() {
        let store = store();
        let parent = store
            .create_portfolio("parent", None, "USDT", dec!(1000))
            .unwrap();
        store
            .create_portfolio("child-a", Some(parent.id), "USDT", dec!(600))
            .unwrap();
        let result = store.create_portfolio("child-b", Some(parent.id), "USDT", dec!(600));
        assert!(matches!(result, Err(StoreError::Hierarchy(_))));
    }

    #[test]
    fn test_reserve_exactly_available_is_accepted() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        let reservation = store
            .reserve_capital(portfolio.id, StrategyId(1), dec!(1000))
            .unwrap();
        assert_eq!(reservation.amount, dec!(1000));
        assert_eq!(
            store.portfolio(portfolio.id).unwrap().available_capital,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_reserve_one_cent_above_available_is_rejected() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        let result = store.reserve_capital(portfolio.id, StrategyId(1), dec!(1000.01));
        assert!(matches!(result, Err(StoreError::InsufficientCapital { .. })));
    }

    #[test]
    fn test_release_restores_available_and_is_idempotent() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        let reservation = store
            .reserve_capital(portfolio.id, StrategyId(1), dec!(400))
            .unwrap();

        assert!(store.release_capital(reservation.id).unwrap().is_some());
        assert_eq!(
            store.portfolio(portfolio.id).unwrap().available_capital,
            dec!(1000)
        );
        // Second release is a no-op.
        assert!(store.release_capital(reservation.id).unwrap().is_none());
        assert_eq!(
            store.portfolio(portfolio.id).unwrap().available_capital,
            dec!(1000)
        );
    }

    #[test]
    fn test_settle_buy_moves_cash_into_position() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(10000))
            .unwrap();
        let reservation = store
            .reserve_capital(portfolio.id, StrategyId(1), dec!(1000))
            .unwrap();

        // Buy cost 1000: cash leaves the pool entirely.
        store
            .settle_capital(reservation.id, dec!(-1000))
            .unwrap()
            .unwrap();
        let portfolio = store.portfolio(portfolio.id).unwrap();
        assert_eq!(portfolio.available_capital, dec!(9000));
        assert_eq!(portfolio.total_capital, dec!(9000));
        assert!(store.open_reservations(None).unwrap().is_empty());
    }

    #[test]
    fn test_settle_sell_returns_proceeds() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        let reservation = store
            .reserve_capital(portfolio.id, StrategyId(1), dec!(500))
            .unwrap();

        store
            .settle_capital(reservation.id, dec!(550))
            .unwrap()
            .unwrap();
        let portfolio = store.portfolio(portfolio.id).unwrap();
        assert_eq!(portfolio.total_capital, dec!(1550));
        assert_eq!(portfolio.available_capital, dec!(1550));
    }

    #[test]
    fn test_ledger_invariant_after_repair() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        store
            .reserve_capital(portfolio.id, StrategyId(1), dec!(300))
            .unwrap();

        // Inject drift directly.
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE portfolios SET available_capital = '123' WHERE id = ?1",
                    params![portfolio.id.0],
                )?;
                Ok(())
            })
            .unwrap();

        let repaired = store.repair_available_capital().unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].2, dec!(700));
        assert_eq!(
            store.portfolio(portfolio.id).unwrap().available_capital,
            dec!(700)
        );

        // Second run performs no writes.
        assert!(store.repair_available_capital().unwrap().is_empty());
    }

    #[test]
    fn test_rules_round_trip() {
        let store = store();
        let portfolio = store
            .create_portfolio("main", None, "USDT", dec!(1000))
            .unwrap();
        store
            .add_rule(
                portfolio.id,
                &RuleKind::MaxPositionSizePct { pct: dec!(10) },
            )
            .unwrap();
        store
            .add_rule(
                portfolio.id,
                &RuleKind::BlockedSymbol {
                    symbol: "DOGE/USDT".into(),
                },
            )
            .unwrap();

        let rules = store.rules(portfolio.id).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name(), "MAX_POSITION_SIZE_PCT");
        assert_eq!(rules[1].name(), "BLOCKED_SYMBOL");
    }
}
