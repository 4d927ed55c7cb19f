use crate::{error::StoreError, sql, Store};
use chrono::Utc;
use rusqlite::params;

/// Deployment-wide gates persisted across restarts.
///
/// The connector consults these before accepting `commands.execute_trade`:
/// trading requires `system_ready` set by a completed reconciliation and
/// `trading_halted` clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFlags {
    pub system_ready: bool,
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
}

impl SystemFlags {
    pub fn trading_allowed(&self) -> bool {
        self.system_ready && !self.trading_halted
    }
}

impl Store {
    pub fn system_flags(&self) -> Result<SystemFlags, StoreError> {
        self.with_conn(|conn| {
            let (system_ready, trading_halted, halt_reason) = conn.query_row(
                "SELECT system_ready, trading_halted, halt_reason FROM system_flags WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(SystemFlags {
                system_ready,
                trading_halted,
                halt_reason,
            })
        })
    }

    /// Set by the Core Engine once reconciliation completes; cleared at the
    /// start of every boot so a crashed engine cannot leave a stale green
    /// light behind.
    pub fn set_system_ready(&self, ready: bool) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE system_flags SET system_ready = ?1, updated_at = ?2 WHERE id = 1",
                params![ready, sql::time_sql(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn set_trading_halted(
        &self,
        halted: bool,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE system_flags SET trading_halted = ?1, halt_reason = ?2, updated_at = ?3
                 WHERE id = 1",
                params![halted, reason, sql::time_sql(Utc::now())],
            )?;
            Ok(())
        })
    }
}
