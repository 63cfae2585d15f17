//! Daemon that watches the active keyboard layout and recolors the
//! keyboard through the dispatch engine.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use via_hue::{CommandLayoutSource, DispatchEngine, LayoutWatcher, ViaApplier, WatcherConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "via-hue-watcher",
    about = "Match keyboard RGB color to the active keyboard layout"
)]
struct Cli {
    /// Config file path (default: the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config_path = cli
        .config
        .or_else(WatcherConfig::default_path)
        .context("Could not determine config path")?;
    let config = WatcherConfig::load_or_init(&config_path)?;

    info!(path = ?config_path, "Starting via-hue-watcher");

    let engine = DispatchEngine::new(ViaApplier, config.device_params(), config.rate_limit());
    let source = CommandLayoutSource::new(config.layout_command.clone());
    let watcher = LayoutWatcher::new(config, engine.clone(), source, Some(config_path));

    let cancel = CancellationToken::new();
    let watcher_task = tokio::spawn(watcher.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    cancel.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, watcher_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Watcher exited with error: {e:#}"),
        Ok(Err(e)) => error!("Watcher task panicked: {e}"),
        Err(_) => error!("Watcher did not stop within {SHUTDOWN_GRACE:?}"),
    }
    engine.shutdown(SHUTDOWN_GRACE).await;

    info!("Stopped");
    Ok(())
}
