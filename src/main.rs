use change_dispatch::api::router;
use change_dispatch::dispatch::Dispatcher;
use change_dispatch::error::DispatchError;
use change_dispatch::logging::{FileLogger, setup_logging};
use change_dispatch::secrets::build_secret_provider;
use change_dispatch::trigger::TriggerClient;
use change_dispatch::{AppState, DispatchConfig, load_config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_CONFIG_PATH: &str = "dispatch_config.toml";

async fn run(config: DispatchConfig, bind_address: &str) -> Result<(), DispatchError> {
    let secrets = build_secret_provider(&config.secrets)?;
    let trigger = TriggerClient::from_config(&config.trigger);
    let state = Arc::new(AppState::new(Dispatcher::new(config, secrets, trigger)));

    let app = router(state);

    info!("Listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| DispatchError::ConfigError(format!("Failed to bind {}: {}", bind_address, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| DispatchError::ConfigError(format!("Server error: {}", e)))
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path =
        std::env::var("DISPATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let file_logger = std::env::var("LOG_DIR").ok().map(|dir| FileLogger::new(PathBuf::from(dir)));
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging setup error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match load_config(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Using config at {:?}", config_path);
    info!(
        "Dispatching pushes to '{}' for projects {:?} (shared: {:?})",
        config.trigger_branch, config.catalog.includes, config.catalog.common
    );

    if let Err(e) = run(config, &bind_address).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
