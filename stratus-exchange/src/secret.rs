use crate::error::ExchangeError;
use std::collections::HashMap;

/// Injected credential source. The connector requires secrets for exchange
/// API keys; the wider system reuses the same contract for bus and database
/// credentials.
///
/// Implementations must have no side effects beyond the lookup itself, and
/// callers must never log returned values.
pub trait SecretProvider: Send + Sync {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, ExchangeError>;
}

/// Secrets from process environment variables, the default in container
/// deployments. Lookup is by exact variable name.
#[derive(Debug, Default, Clone)]
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, ExchangeError> {
        std::env::var(name)
            .map(String::into_bytes)
            .map_err(|_| ExchangeError::SecretMissing(name.to_string()))
    }
}

/// Fixed in-memory secrets for tests and `dry_run`.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    secrets: HashMap<String, Vec<u8>>,
}

impl StaticSecrets {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.as_bytes().to_vec());
        self
    }
}

impl SecretProvider for StaticSecrets {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, ExchangeError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| ExchangeError::SecretMissing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_secrets_lookup() {
        let secrets = StaticSecrets::default().with("binance_spot_api_key", "k");
        assert_eq!(secrets.get_secret("binance_spot_api_key").unwrap(), b"k");
        assert!(matches!(
            secrets.get_secret("missing"),
            Err(ExchangeError::SecretMissing(_))
        ));
    }
}
