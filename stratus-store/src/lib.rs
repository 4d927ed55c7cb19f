#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Stratus-Store
//! The database is the single source of truth for configuration and the
//! durable journal of activity. This crate owns the schema, the forward-only
//! migrations, and the repositories every component reads and writes through.
//!
//! Monetary values are stored as exact decimal text and never touch binary
//! floating point. The store is also the concurrency-control point for
//! capital: reserve/release/settle run inside a single transaction.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::{path::Path, sync::Arc};

mod migrations;

/// All [`StoreError`](error::StoreError) variants.
pub mod error;

/// Portfolios, portfolio rules, and atomic capital reservations.
pub mod portfolio;

/// Strategy configuration rows, portfolio mapping, and worker snapshots.
pub mod strategy;

/// The append-only trade journal and its monotonic status machine.
pub mod trade;

/// The derived positions cache.
pub mod position;

/// Deployment-wide flags: ready / halted gates that survive restarts.
pub mod system;

mod sql;

use error::StoreError;

/// Handle onto the Stratus database. Cheap to clone; all clones share one
/// serialized connection.
///
/// SQLite is a single-writer engine, which makes the store trivially the
/// per-portfolio single-writer region the capital ledger requires.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and apply any
    /// outstanding migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|error| StoreError::Io(error.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Used by tests and `dry_run`
    /// experiments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the locked connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}
