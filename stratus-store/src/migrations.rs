use crate::error::StoreError;
use rusqlite::Connection;
use tracing::info;

/// Forward-only migrations, applied in order. The schema version lives in
/// `PRAGMA user_version`; editing a shipped migration is forbidden - append a
/// new one instead.
const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    "
    CREATE TABLE portfolios (
        id                INTEGER PRIMARY KEY,
        name              TEXT NOT NULL UNIQUE,
        parent_id         INTEGER REFERENCES portfolios(id),
        base_currency     TEXT NOT NULL,
        total_capital     TEXT NOT NULL,
        available_capital TEXT NOT NULL,
        is_active         INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE portfolio_rules (
        id           INTEGER PRIMARY KEY,
        portfolio_id INTEGER NOT NULL REFERENCES portfolios(id),
        rule_type    TEXT NOT NULL,
        rule_value   TEXT NOT NULL
    );

    CREATE TABLE strategies (
        id               INTEGER PRIMARY KEY,
        name             TEXT NOT NULL UNIQUE,
        strategy_type    TEXT NOT NULL,
        exchange         TEXT NOT NULL,
        symbol           TEXT NOT NULL,
        parameters       TEXT NOT NULL DEFAULT '{}',
        position_sizing  TEXT,
        is_active        INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE strategy_portfolio_map (
        strategy_id  INTEGER PRIMARY KEY REFERENCES strategies(id),
        portfolio_id INTEGER NOT NULL REFERENCES portfolios(id)
    );

    CREATE TABLE trades (
        id                INTEGER PRIMARY KEY,
        strategy_id       INTEGER NOT NULL,
        exchange          TEXT NOT NULL,
        symbol            TEXT NOT NULL,
        exchange_order_id TEXT UNIQUE,
        client_order_id   TEXT NOT NULL UNIQUE,
        reservation_id    INTEGER,
        kind              TEXT NOT NULL,
        side              TEXT NOT NULL,
        amount            TEXT NOT NULL,
        price             TEXT,
        filled_amount     TEXT NOT NULL DEFAULT '0',
        avg_fill_price    TEXT,
        fee               TEXT,
        realized_pnl      TEXT,
        status            TEXT NOT NULL,
        settled_at        TEXT,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL
    );
    CREATE INDEX idx_trades_status ON trades(status);
    CREATE INDEX idx_trades_strategy_updated ON trades(strategy_id, updated_at);

    CREATE TABLE positions (
        strategy_id    INTEGER NOT NULL,
        exchange       TEXT NOT NULL,
        symbol         TEXT NOT NULL,
        entry_price    TEXT NOT NULL,
        current_size   TEXT NOT NULL,
        unrealized_pnl TEXT NOT NULL,
        realized_pnl   TEXT NOT NULL,
        is_open        INTEGER NOT NULL,
        updated_at     TEXT NOT NULL,
        PRIMARY KEY (strategy_id, exchange, symbol)
    );

    CREATE TABLE reservations (
        id           INTEGER PRIMARY KEY,
        portfolio_id INTEGER NOT NULL REFERENCES portfolios(id),
        strategy_id  INTEGER NOT NULL,
        amount       TEXT NOT NULL,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE strategy_snapshots (
        strategy_id INTEGER PRIMARY KEY,
        state       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE system_flags (
        id             INTEGER PRIMARY KEY CHECK (id = 1),
        system_ready   INTEGER NOT NULL DEFAULT 0,
        trading_halted INTEGER NOT NULL DEFAULT 0,
        halt_reason    TEXT,
        updated_at     TEXT NOT NULL
    );
    INSERT INTO system_flags (id, system_ready, trading_halted, updated_at)
        VALUES (1, 0, 0, '1970-01-01T00:00:00Z');
    ",
    // 2: the `manual` pseudo-strategy carrying positions adopted by
    // reconciliation. Never spawned as a worker.
    "
    INSERT INTO strategies (id, name, strategy_type, exchange, symbol, parameters, position_sizing, is_active)
        VALUES (0, 'manual', 'manual', 'mock', 'MANUAL', '{}', NULL, 0);
    ",
];

pub(crate) fn apply(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (index, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        conn.execute_batch(&format!("BEGIN; {migration} COMMIT;"))?;
        conn.pragma_update(None, "user_version", index as i64 + 1)?;
        info!(version = index + 1, "applied schema migration");
    }

    Ok(())
}
