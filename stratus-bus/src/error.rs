use crate::key::RoutingKey;
use stratus_model::error::ErrorKind;

/// All errors produced by the bus transports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("broker unreachable: {0}")]
    Unavailable(String),

    #[error("bounded queue full for consumer group {group} on {pattern}")]
    QueueFull { group: String, pattern: String },

    #[error("payload error on {key}: {error}")]
    Payload { key: RoutingKey, error: String },

    #[error("bus shut down")]
    Closed,
}

impl BusError {
    /// Map into the system-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Unavailable(_) | BusError::Closed => ErrorKind::BusUnavailable,
            BusError::QueueFull { .. } => ErrorKind::ValidationFailed,
            BusError::Payload { .. } => ErrorKind::InternalBug,
        }
    }
}

impl From<::redis::RedisError> for BusError {
    fn from(error: ::redis::RedisError) -> Self {
        BusError::Unavailable(error.to_string())
    }
}
