use serde::{Deserialize, Serialize};

/// The taxonomy every Stratus failure maps into before it crosses a component
/// boundary.
///
/// Transient kinds are retried locally with bounded backoff; permanent kinds
/// short-circuit to a terminal event; [`ErrorKind::InternalBug`] halts the
/// offending component.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed configuration; fatal at startup.
    ConfigInvalid,
    /// Message broker unreachable; fatal if prolonged.
    BusUnavailable,
    /// Database unreachable; fatal if prolonged.
    DbUnavailable,
    /// Credential not found; fatal for the affected component.
    SecretMissing,
    /// Network error, 5xx, or other retryable exchange failure.
    ExchangeTransient,
    /// Invalid order, insufficient funds, auth rejected; never retried.
    ExchangePermanent,
    /// Capital Manager refusal.
    ValidationFailed,
    /// Mismatch between journal and exchange truth.
    ReconcileDrift,
    /// A suspension exceeded its bound.
    Timeout,
    /// Rate-limit budget exhausted after the bounded wait.
    RateLimited,
    /// Invariant violation; the component must halt itself.
    InternalBug,
}

impl ErrorKind {
    /// Whether local bounded retry is appropriate for this kind.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExchangeTransient
                | ErrorKind::BusUnavailable
                | ErrorKind::DbUnavailable
                | ErrorKind::Timeout
        )
    }
}

/// Failure to parse a domain type from its string representation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognised exchange: {0}")]
    Exchange(String),
    #[error("unrecognised trade status: {0}")]
    TradeStatus(String),
    #[error("unrecognised side: {0}")]
    Side(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ExchangeTransient).unwrap();
        assert_eq!(json, "\"exchange_transient\"");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::ExchangeTransient.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::ExchangePermanent.is_transient());
        assert!(!ErrorKind::InternalBug.is_transient());
    }
}
