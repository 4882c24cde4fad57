//! Tradewind - headless trading engine
//!
//! Runs the engine without any UI or inbound HTTP surface. State lives in
//! SQLite; logs go to stdout as structured tracing output.
//!
//! # Usage
//! ```sh
//! TRADEWIND_CONFIG=tradewind.toml cargo run
//! ```
//!
//! Broker and market-data transports plug in at the `Broker` and
//! `MarketData` ports. This binary wires the in-memory paper
//! implementations; a live deployment swaps them for real adaptors at the
//! same seams.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::prelude::*;

use tradewind::application::Engine;
use tradewind::config::Config;
use tradewind::infrastructure::mock::{MockBroker, MockMarketData};
use tradewind::infrastructure::persistence::{Database, SqliteStateRepository};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables (broker credentials live here, not in the
    // config file).
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Tradewind {} starting...", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("TRADEWIND_CONFIG").unwrap_or_else(|_| "tradewind.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "configuration rejected");
            return Err(e.into());
        }
    };
    info!(
        path = %config_path,
        dry_run = config.execution.dry_run,
        kill_switch = config.execution.kill_switch,
        equities = config.symbols.equity_symbols.len(),
        crypto = config.symbols.crypto_symbols.len(),
        "configuration loaded"
    );

    let database = Database::new(&config.database.url).await?;
    let repository = Arc::new(SqliteStateRepository::new(database));

    // Paper transports; live adaptors replace these two lines.
    let broker = Arc::new(MockBroker::new());
    let market_data = Arc::new(MockMarketData::new());

    let engine = Engine::new(config, repository, broker, market_data);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await?;
    info!("Tradewind stopped.");
    Ok(())
}
