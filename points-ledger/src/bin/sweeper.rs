//! Points expiry sweeper binary
//!
//! Usage: `points-sweeper [config.toml] [--once]`
//!
//! Without a config path the settings come from `POINTS_*` environment
//! variables. `--once` runs a single sweep and exits.
//!
//! Opening the ledger takes RocksDB's exclusive lock on `data_dir`, so this
//! binary cannot run next to a process that is serving the same ledger; it
//! fails at startup with a lock error instead. It is meant for maintenance
//! windows and one-off backfills. A serving process runs the sweep itself by
//! spawning [`ExpirySweeper::run`] over its own `Arc<Ledger>`.

use anyhow::Context;
use points_ledger::{Config, ExpirySweeper, Ledger};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut once = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--once" => once = true,
            path => config_path = Some(path.to_string()),
        }
    }

    // Load configuration
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };
    let sweep_config = config.sweep.clone();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = %config.data_dir.display(),
        "Starting points sweeper"
    );

    let ledger = Arc::new(Ledger::open(config).await.context("Failed to open ledger")?);
    let sweeper = ExpirySweeper::new(ledger.clone(), sweep_config);

    if once {
        let report = sweeper.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        sweeper
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await;
    }

    let stats = ledger.statistics()?;
    tracing::info!(statistics = %serde_json::to_string(&stats)?, "Ledger statistics");

    drop(sweeper);
    let ledger = Arc::try_unwrap(ledger)
        .map_err(|_| anyhow::anyhow!("Ledger still shared at shutdown"))?;
    ledger.shutdown().await?;

    tracing::info!("Points sweeper stopped");
    Ok(())
}
