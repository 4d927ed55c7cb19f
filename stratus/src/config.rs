use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use stratus_model::{
    event::OrphanPolicy,
    exchange::ExchangeId,
    market::CandlePeriod,
    strategy::PositionSizing,
};

/// Top-level configuration shared by every Stratus binary, loaded from one
/// JSON file per deployment.
///
/// Secrets never live here - they come from the injected secret provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub db: DbConfig,
    /// Per-exchange wiring, keyed by [`ExchangeId`] snake_case name.
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub capital_manager: CapitalSection,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    /// When true, connectors log intended orders and return synthetic fills.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// `memory` for a single-process deployment, or a `redis://` URL.
    pub url: String,
    /// Per-consumer bound for command-class queues.
    pub prefetch: usize,
    /// Per-consumer bound for market-data queues (drop-oldest beyond this).
    pub market_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            prefetch: 64,
            market_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// SQLite path (or `:memory:`). All writes and reconciliation reads.
    pub primary_url: String,
    /// Read replicas for query offload. Never used by reconciliation.
    #[serde(default)]
    pub replica_urls: Vec<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            primary_url: "stratus.db".to_string(),
            replica_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    /// Select the venue's sandbox environment.
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointsConfig {
    pub rest: String,
    pub ws: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            rest: stratus_exchange::client::binance::HTTP_BASE_URL.to_string(),
            ws: stratus_exchange::client::binance::WS_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Fraction shaved off every published limit.
    pub safety_margin: Decimal,
    /// `endpoint -> tokens_per_min` bucket sizes.
    pub endpoints: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert("order".to_string(), 1200);
        Self {
            safety_margin: Decimal::new(1, 1), // 0.1
            endpoints,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Cadence of the periodic reconciliation re-run.
    pub periodic_interval_secs: u64,
    /// What to do with positions the exchange holds but the journal does not.
    pub orphan_policy: OrphanPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 3600,
            orphan_policy: OrphanPolicy::Freeze,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Binary spawned per strategy worker process.
    pub binary: String,
    /// Base restart delay; doubled per consecutive crash.
    pub restart_backoff_secs: u64,
    /// Crashes tolerated inside the rolling window before the strategy is
    /// deactivated.
    pub max_restarts_per_window: u32,
    pub restart_window_secs: u64,
    /// Ring buffer of most recent closed bars held per worker.
    pub history_bars: usize,
    /// Minimum interval between a worker's proposals.
    pub cooldown_secs: u64,
    pub snapshot_interval_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            binary: "stratus-worker".to_string(),
            restart_backoff_secs: 5,
            max_restarts_per_window: 5,
            restart_window_secs: 300,
            history_bars: 500,
            cooldown_secs: 60,
            snapshot_interval_secs: 30,
        }
    }
}

impl WorkerSection {
    pub fn runtime(&self) -> stratus_strategy::worker::WorkerConfig {
        stratus_strategy::worker::WorkerConfig {
            history_bars: self.history_bars,
            cooldown: Duration::from_secs(self.cooldown_secs),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CapitalSection {
    /// Sizing model for strategies whose row does not pin one.
    pub default_sizing_model: PositionSizing,
    /// Global safety cap on fractional Kelly.
    pub kelly_max_fraction: Decimal,
    pub kelly_min_trades: usize,
    /// Age after which an open reservation is investigated.
    pub reservation_timeout_secs: u64,
}

impl Default for CapitalSection {
    fn default() -> Self {
        Self {
            default_sizing_model: PositionSizing::FixedFractional {
                risk_pct: Decimal::new(1, 2), // 0.01
            },
            kelly_max_fraction: Decimal::new(2, 1), // 0.2
            kelly_min_trades: 10,
            reservation_timeout_secs: 300,
        }
    }
}

impl CapitalSection {
    pub fn runtime(&self) -> stratus_capital::CapitalManagerConfig {
        stratus_capital::CapitalManagerConfig {
            default_sizing: self.default_sizing_model.clone(),
            kelly_max_fraction: self.kelly_max_fraction,
            kelly_min_trades: self.kelly_min_trades,
            reservation_timeout: Duration::from_secs(self.reservation_timeout_secs),
            ..stratus_capital::CapitalManagerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MarketDataConfig {
    /// Candle interval streamed to workers.
    pub candle_period: CandlePeriod,
    /// Price cache TTL; strictly shorter than any decision horizon.
    pub cache_ttl_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            candle_period: CandlePeriod::Minute1,
            cache_ttl_secs: 5,
        }
    }
}

/// Configuration failures are fatal at startup (exit code 1).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {error}")]
    Io { path: String, error: String },

    #[error("malformed config {path}: {error}")]
    Parse { path: String, error: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_text = path.as_ref().display().to_string();
        let raw = std::fs::read_to_string(&path).map_err(|error| ConfigError::Io {
            path: path_text.clone(),
            error: error.to_string(),
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|error| ConfigError::Parse {
            path: path_text,
            error: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.prefetch == 0 {
            return Err(ConfigError::Invalid("bus.prefetch must be positive".into()));
        }
        if self.db.primary_url.is_empty() {
            return Err(ConfigError::Invalid("db.primary_url is required".into()));
        }
        for name in self.exchanges.keys() {
            name.parse::<ExchangeId>().map_err(|_| {
                ConfigError::Invalid(format!("unrecognised exchange name: {name}"))
            })?;
        }
        if self.rate_limit.safety_margin < Decimal::ZERO
            || self.rate_limit.safety_margin >= Decimal::ONE
        {
            return Err(ConfigError::Invalid(
                "rate_limit.safety_margin must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Exchanges configured for this deployment, with their wiring.
    pub fn exchange_ids(&self) -> Vec<(ExchangeId, &ExchangeConfig)> {
        self.exchanges
            .iter()
            .filter_map(|(name, exchange)| {
                name.parse::<ExchangeId>().ok().map(|id| (id, exchange))
            })
            .collect()
    }
}
