use clap::Parser;
use std::{collections::HashMap, sync::Arc, time::Duration};
use stratus::{config::Config, logging, system};
use stratus_exchange::{
    connector::{Connector, ConnectorConfig},
    secret::EnvSecrets,
    stream::{CircuitBreakerConfig, MarketStreamConfig, ReconnectionBackoffPolicy},
};
use stratus_model::{exchange::ExchangeId, instrument::Symbol};
use tracing::{error, info, warn};

/// Exchange Connector: the anti-corruption layer to external venues.
#[derive(Debug, Parser)]
#[command(name = "stratus-connector", version, about)]
struct Args {
    /// Path to the system configuration file.
    #[arg(long, default_value = "stratus.json")]
    config: String,

    /// Emit JSON logs for log-shipping deployments.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.json_logs {
        logging::init_json_logging();
    } else {
        logging::init_logging();
    }
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(config_error) => {
            error!(%config_error, "configuration invalid");
            return 1;
        }
    };

    let bus = match system::build_bus(&config).await {
        Ok(bus) => bus,
        Err(system_error) => {
            error!(%system_error, "bus connection failed");
            return system_error.exit_code();
        }
    };
    let store = match system::open_store(&config) {
        Ok(store) => store,
        Err(system_error) => {
            error!(%system_error, "database connection failed");
            return system_error.exit_code();
        }
    };
    let clients = match system::build_clients(&config, &EnvSecrets) {
        Ok(clients) => clients,
        Err(system_error) => {
            error!(%system_error, "exchange client construction failed");
            return system_error.exit_code();
        }
    };

    let limiter = system::build_limiter(&config);
    let cache = system::build_price_cache(&config);

    // One market stream per exchange, covering every symbol its strategies
    // subscribe to.
    let mut symbols_by_exchange: HashMap<ExchangeId, Vec<Symbol>> = HashMap::new();
    match store.strategies(true) {
        Ok(strategies) => {
            for strategy in strategies {
                let symbols = symbols_by_exchange.entry(strategy.exchange).or_default();
                if !symbols.contains(&strategy.symbol) {
                    symbols.push(strategy.symbol);
                }
            }
        }
        Err(store_error) => {
            error!(%store_error, "cannot enumerate strategies for market data");
            return 3;
        }
    }

    for (exchange, wiring) in config.exchange_ids() {
        if exchange == ExchangeId::Mock {
            // The mock venue has no wire; tests and dry runs feed the bus
            // directly.
            continue;
        }
        let Some(symbols) = symbols_by_exchange.get(&exchange).cloned() else {
            warn!(%exchange, "no active strategies; skipping market stream");
            continue;
        };
        let Some(client) = clients.get(&exchange).cloned() else {
            continue;
        };
        let stream_config = MarketStreamConfig {
            exchange,
            ws_base_url: wiring.endpoints.ws.clone(),
            symbols,
            period: config.market_data.candle_period,
            backoff: ReconnectionBackoffPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        };
        info!(%exchange, "spawning market stream");
        tokio::spawn(stratus_exchange::stream::run_market_stream(
            Arc::clone(&bus),
            cache.clone(),
            client,
            stream_config,
        ));
    }

    let connector = Connector::new(
        bus,
        store,
        clients,
        limiter,
        cache,
        ConnectorConfig {
            rate_limit_budget: Duration::from_secs(2),
            dry_run: config.dry_run,
            ..ConnectorConfig::default()
        },
    );

    tokio::select! {
        result = connector.run() => match result {
            Ok(()) => 0,
            Err(connector_error) => {
                error!(%connector_error, "connector terminated");
                3
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("connector interrupted");
            0
        }
    }
}
