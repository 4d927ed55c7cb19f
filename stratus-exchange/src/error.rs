use stratus_model::error::ErrorKind;

/// All errors produced at the exchange boundary, pre-classed for retry
/// policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    /// Network failure, 5xx, or other retryable condition.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The venue's rate limit pushed back (eg/ HTTP 429), or the local token
    /// bucket stayed empty past its bounded wait.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Invalid order, insufficient funds, auth rejected. Never retried.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    /// An exchange call exceeded its mandatory deadline.
    #[error("exchange call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Credential missing from the secret provider.
    #[error("secret missing: {0}")]
    SecretMissing(String),
}

impl ExchangeError {
    /// Map into the system-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Transient(_) => ErrorKind::ExchangeTransient,
            ExchangeError::RateLimited(_) => ErrorKind::RateLimited,
            ExchangeError::Permanent(_) => ErrorKind::ExchangePermanent,
            // Timeouts upgrade to transient: the order may or may not exist,
            // so the caller re-checks status before any retry.
            ExchangeError::Timeout(_) => ErrorKind::Timeout,
            ExchangeError::SecretMissing(_) => ErrorKind::SecretMissing,
        }
    }

    /// Whether a bounded local retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_) | ExchangeError::Timeout(_) | ExchangeError::RateLimited(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ExchangeError::Timeout(std::time::Duration::from_secs(0))
        } else if let Some(status) = error.status() {
            if status.as_u16() == 429 || status.as_u16() == 418 {
                ExchangeError::RateLimited(status.to_string())
            } else if status.is_server_error() {
                ExchangeError::Transient(status.to_string())
            } else {
                ExchangeError::Permanent(status.to_string())
            }
        } else {
            ExchangeError::Transient(error.to_string())
        }
    }
}
