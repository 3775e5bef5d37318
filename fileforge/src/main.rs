use anyhow::Context;
use tracing::{error, info};

use fileforge::api::ApiServer;
use fileforge::config::AppConfig;
use fileforge::logging::init_logging;
use fileforge::panic_hook;
use fileforge::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let (logging_config, _log_guard) =
        init_logging(&config.log_dir, config.log_format).context("Failed to initialize logging")?;
    panic_hook::install(&config.log_dir);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fileforge");

    let container = ServiceContainer::new(config.clone())
        .await
        .context("Failed to initialize services")?
        .with_logging_config(logging_config);
    container
        .initialize()
        .await
        .context("Failed to start background services")?;

    let server = ApiServer::with_state(config.api.clone(), container.app_state());
    let server_token = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        server_token.cancel();
    });

    let served = server.run().await;

    container.shutdown().await?;
    served.context("API server failed")?;

    info!("fileforge stopped");
    Ok(())
}
