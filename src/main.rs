//! corewarden: supervises a proxy core and accounts for its traffic.
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────────┐   list_inbounds   ┌──────────┐  DesiredConfig  ┌────────────┐
//!   │ ConfigStore  │──────────────────▶│ Compiler │────────────────▶│ Reconciler │
//!   │  (SQLite)    │                   └──────────┘                 └─────┬──────┘
//!   └──────▲───────┘                                      start / reload │
//!          │ flush / disable                                             ▼
//!   ┌──────┴───────┐   merge_batch   ┌───────────┐  query   ┌────────────────────┐
//!   │TrafficLedger │◀────────────────│ Collector │◀─────────│ Supervisor ─▶ core │
//!   └──────────────┘                 └───────────┘          └────────────────────┘
//!          ▲                                                          │ access log
//!   ┌──────┴───────┐  LimitExceeded  ┌───────────┐                     │
//!   │PolicyEnforcer│◀────────────────│ IpMonitor │◀────────────────────┘
//!   └──────────────┘                 └───────────┘
//!
//!   Scheduler drives every box above on its own interval.
//! ```

use std::path::PathBuf;

use clap::Parser;

use corewarden::config::{loader::load_config, EngineConfig};
use corewarden::engine::Engine;
use corewarden::lifecycle::signals::wait_for_signal;
use corewarden::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "corewarden")]
#[command(about = "Proxy core supervisor and traffic accountant", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "COREWARDEN_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "corewarden starting");

    if let Some(path) = &args.config {
        tracing::info!(path = %path.display(), "Configuration loaded");
    } else {
        tracing::warn!("No configuration file given, using defaults");
    }
    tracing::info!(
        binary = %config.core.binary_path.display(),
        database = %config.store.database_path.display(),
        api = %config.core.api_address(),
        "Core settings"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut engine = Engine::open(config)?;
    engine.start().await?;

    wait_for_signal().await;
    engine.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
