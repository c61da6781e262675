//! Ledger node binary
//!
//! Reads `LEDGER_CONFIG` (a TOML file) when set, environment variables
//! otherwise, then serves HTTP and runs the sync loop until terminated.

use anyhow::Context;
use dotenv::dotenv;
use ledger_node::{config::LoggingConfig, server, Config, Node};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("Failed to load config from {}", path)),
        Err(_) => Config::from_env().context("Failed to load config from environment"),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = load_config()?;
    init_tracing(&config.logging);

    info!(
        service = %config.service_name,
        version = %config.service_version,
        node = %config.node.id,
        "Starting ledger node"
    );

    let node = Node::open(config).await.context("Failed to open node")?;

    let server = server::build_server(node.clone()).context("Failed to bind HTTP server")?;
    let server_handle = server.handle();

    let signal_node = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_node.stop();
        }
    });

    let sync_node = node.clone();
    let sync_task = tokio::spawn(async move {
        sync_node.run().await;
        server_handle.stop(true).await;
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
        node.stop();
    }

    sync_task.await.context("Sync loop panicked")?;
    node.shutdown().await.context("Failed to close ledger")?;

    info!("Ledger node stopped");
    Ok(())
}
