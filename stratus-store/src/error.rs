use rust_decimal::Decimal;
use stratus_model::{error::ErrorKind, order::TradeStatus};

/// All errors produced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid trade status transition {from} -> {to}")]
    InvalidTransition { from: TradeStatus, to: TradeStatus },

    #[error("insufficient capital: requested {requested}, available {available}")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },

    #[error("portfolio hierarchy violation: {0}")]
    Hierarchy(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Map into the system-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Sqlite(_) | StoreError::Io(_) => ErrorKind::DbUnavailable,
            StoreError::NotFound { .. }
            | StoreError::InsufficientCapital { .. }
            | StoreError::Hierarchy(_) => ErrorKind::ValidationFailed,
            StoreError::InvalidTransition { .. } | StoreError::Corrupt(_) => ErrorKind::InternalBug,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
