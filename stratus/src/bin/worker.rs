use clap::Parser;
use stratus::{config::Config, logging, system};
use stratus_model::strategy::StrategyId;
use stratus_strategy::worker::StrategyWorker;
use tracing::{error, info};

/// Strategy Worker: one isolated process per running strategy.
#[derive(Debug, Parser)]
#[command(name = "stratus-worker", version, about)]
struct Args {
    /// Path to the system configuration file.
    #[arg(long, default_value = "stratus.json")]
    config: String,

    /// The `strategies` row this worker executes.
    #[arg(long)]
    strategy_id: i64,

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

    let strategy_id = StrategyId(args.strategy_id);
    let record = match store.strategy(strategy_id) {
        Ok(record) => record,
        Err(store_error) => {
            error!(%store_error, %strategy_id, "strategy row unavailable");
            return 1;
        }
    };
    info!(strategy = %record.name, "worker booting");

    let worker = match StrategyWorker::new(record, bus, store, config.worker.runtime()) {
        Ok(worker) => worker,
        Err(strategy_error) => {
            error!(%strategy_error, "strategy construction failed");
            return 1;
        }
    };

    tokio::select! {
        result = worker.run() => match result {
            Ok(()) => 0,
            Err(worker_error) => {
                error!(%worker_error, "worker terminated");
                3
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("worker interrupted");
            0
        }
    }
}
