use clap::Parser;
use stratus::{config::Config, logging, system};
use stratus_capital::CapitalManager;
use tracing::{error, info};

/// Capital Manager: the gatekeeper between proposals and orders.
#[derive(Debug, Parser)]
#[command(name = "stratus-capital", version, about)]
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

    let mut manager = CapitalManager::new(bus, store, config.capital_manager.runtime());
    tokio::select! {
        result = manager.run() => match result {
            Ok(()) => 0,
            Err(capital_error) => {
                error!(%capital_error, "capital manager terminated");
                3
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("capital manager interrupted");
            0
        }
    }
}
