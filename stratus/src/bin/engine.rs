use clap::Parser;
use stratus::{config::Config, engine::Engine, logging, system};
use stratus_exchange::secret::EnvSecrets;
use tracing::error;

/// Core Engine: supervises workers, reconciles state, aggregates health.
#[derive(Debug, Parser)]
#[command(name = "stratus-engine", version, about)]
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

    let engine = Engine::new(config, &args.config, bus, store, clients);
    match engine.run().await {
        Ok(()) => 0,
        Err(engine_error) => {
            error!(%engine_error, "engine terminated");
            engine_error.exit_code()
        }
    }
}
