use crate::config::{Config, ConfigError};
use std::{collections::HashMap, sync::Arc, time::Duration};
use stratus_bus::{memory::InMemoryBus, redis::RedisBus, MessageBus};
use stratus_exchange::{
    cache::PriceCache,
    client::{binance::BinanceSpot, mock::MockExchange, mock::MockExchangeConfig, ExecutionClient},
    limit::RateLimiter,
    secret::SecretProvider,
};
use stratus_model::exchange::ExchangeId;
use stratus_store::Store;
use tracing::info;

/// Failures while wiring a component from its configuration. `exit_code`
/// matches the documented process contract: 1 for configuration, 3 for
/// infrastructure loss.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bus unavailable: {0}")]
    Bus(String),

    #[error("database unavailable: {0}")]
    Db(String),

    #[error("exchange client: {0}")]
    Exchange(String),
}

impl SystemError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SystemError::Config(_) => 1,
            SystemError::Bus(_) | SystemError::Db(_) => 3,
            SystemError::Exchange(_) => 1,
        }
    }
}

/// Default per-exchange-call deadline. Every suspension at the exchange
/// boundary is bounded.
const EXCHANGE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect the configured broker: `memory` or `redis://`.
pub async fn build_bus(config: &Config) -> Result<Arc<dyn MessageBus>, SystemError> {
    let bus = &config.bus;
    if bus.url == "memory" {
        info!(prefetch = bus.prefetch, "using in-memory bus");
        return Ok(Arc::new(InMemoryBus::new(bus.prefetch, bus.market_depth)));
    }
    if bus.url.starts_with("redis://") || bus.url.starts_with("rediss://") {
        let redis = RedisBus::connect(&bus.url, "stratus")
            .await
            .map_err(|error| SystemError::Bus(error.to_string()))?;
        info!("connected to redis bus");
        return Ok(Arc::new(redis));
    }
    Err(SystemError::Config(ConfigError::Invalid(format!(
        "unrecognised bus.url: {}",
        bus.url
    ))))
}

/// Open the primary database. Fail fast when unreachable.
pub fn open_store(config: &Config) -> Result<Store, SystemError> {
    let store = if config.db.primary_url == ":memory:" {
        Store::open_in_memory()
    } else {
        Store::open(&config.db.primary_url)
    };
    store.map_err(|error| SystemError::Db(error.to_string()))
}

/// Build one execution client per configured exchange. Under `dry_run`, every
/// venue is replaced by a mock returning synthetic fills.
pub fn build_clients(
    config: &Config,
    secrets: &dyn SecretProvider,
) -> Result<HashMap<ExchangeId, Arc<dyn ExecutionClient>>, SystemError> {
    let mut clients: HashMap<ExchangeId, Arc<dyn ExecutionClient>> = HashMap::new();

    for (exchange, wiring) in config.exchange_ids() {
        if config.dry_run || exchange == ExchangeId::Mock {
            info!(%exchange, "using mock execution client");
            clients.insert(exchange, Arc::new(MockExchange::new(MockExchangeConfig::default())));
            continue;
        }
        match exchange {
            ExchangeId::BinanceSpot => {
                let base_url = if wiring.testnet {
                    stratus_exchange::client::binance::HTTP_BASE_URL_TESTNET
                } else {
                    wiring.endpoints.rest.as_str()
                };
                let client = BinanceSpot::new(base_url, secrets, EXCHANGE_CALL_TIMEOUT)
                    .map_err(|error| SystemError::Exchange(error.to_string()))?;
                clients.insert(exchange, Arc::new(client));
            }
            ExchangeId::Mock => unreachable!("handled above"),
        }
    }

    Ok(clients)
}

pub fn build_limiter(config: &Config) -> Arc<RateLimiter> {
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.safety_margin));
    for (endpoint, tokens_per_min) in &config.rate_limit.endpoints {
        // Bucket names are a closed set defined by the connector.
        if endpoint == stratus_exchange::connector::ENDPOINT_ORDER {
            limiter.register(stratus_exchange::connector::ENDPOINT_ORDER, *tokens_per_min);
        }
    }
    limiter
}

pub fn build_price_cache(config: &Config) -> PriceCache {
    PriceCache::new(Duration::from_secs(config.market_data.cache_ttl_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_exchange::secret::StaticSecrets;

    #[tokio::test]
    async fn test_memory_bus_from_defaults() {
        let config = Config::default();
        assert!(build_bus(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_bus_url_is_config_error() {
        let mut config = Config::default();
        config.bus.url = "amqp://localhost".to_string();
        let error = build_bus(&config).await.unwrap_err();
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_dry_run_swaps_in_mock_clients() {
        let mut config = Config::default();
        config.dry_run = true;
        config
            .exchanges
            .insert("binance_spot".to_string(), Default::default());
        let clients = build_clients(&config, &StaticSecrets::default()).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(
            clients[&ExchangeId::BinanceSpot].exchange(),
            ExchangeId::Mock
        );
    }
}
