//! Layout polling loop: maps the active layout to a color and feeds the
//! dispatch engine.

use crate::color::ColorSpec;
use crate::config::WatcherConfig;
use crate::dispatch::{ColorApplier, DispatchEngine};
use crate::layout::LayoutSource;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LayoutWatcher<A: ColorApplier, L: LayoutSource> {
    config: Arc<Mutex<WatcherConfig>>,
    engine: DispatchEngine<A>,
    source: L,
    /// When set, the file is re-read on mtime change each poll cycle.
    config_path: Option<PathBuf>,
    /// Mtime of the file the in-memory config was loaded from; edits after
    /// this are picked up by the reload check.
    config_mtime: Option<SystemTime>,
}

impl<A: ColorApplier, L: LayoutSource> LayoutWatcher<A, L> {
    pub fn new(
        config: WatcherConfig,
        engine: DispatchEngine<A>,
        source: L,
        config_path: Option<PathBuf>,
    ) -> Self {
        let config_mtime = config_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok());
        Self {
            config: Arc::new(Mutex::new(config)),
            engine,
            source,
            config_path,
            config_mtime,
        }
    }

    /// Replaces the configuration wholesale and pushes the fresh device
    /// parameters into the engine.
    pub async fn update_config(&self, new_config: WatcherConfig) {
        self.engine.update_params(new_config.device_params()).await;
        *self.config.lock().await = new_config;
        info!("Configuration updated");
    }

    /// Polls until cancelled. The config guard is held only for the brief
    /// reads, never across an external call; send_color rejections are
    /// retried naturally on the next cycle.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut last_layout: Option<String> = None;
        let mut last_mtime = self.config_mtime;

        info!("Layout watcher started");

        loop {
            let interval = self.config.lock().await.poll_interval();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            self.check_and_reload_config(&mut last_mtime).await;

            // Read after the reload so a freshly disabled config skips this
            // very cycle.
            if !self.config.lock().await.enabled {
                continue;
            }

            let layout = match self.source.current_layout().await {
                Ok(layout) => layout,
                Err(e) => {
                    warn!("Layout probe failed: {e:#}");
                    continue;
                }
            };

            let color_str = {
                let config = self.config.lock().await;
                config.color_for_layout(layout.as_deref()).to_string()
            };

            let spec: ColorSpec = match color_str.parse() {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(color = %color_str, "Configured color is invalid: {e}");
                    continue;
                }
            };

            if layout != last_layout {
                info!(
                    from = ?last_layout,
                    to = ?layout,
                    color = %spec,
                    "Layout changed"
                );
                last_layout = layout;
            }

            if self.engine.send_color(spec).await {
                debug!("Color submitted");
            }
        }

        info!("Layout watcher stopped");
        Ok(())
    }

    async fn check_and_reload_config(&self, last_mtime: &mut Option<SystemTime>) {
        let Some(path) = &self.config_path else { return };
        let Ok(meta) = std::fs::metadata(path) else { return };
        let Ok(mtime) = meta.modified() else { return };

        // The baseline mtime was captured in new(); anything newer is an
        // edit we have not loaded, including one made before the first poll.
        if last_mtime.is_some_and(|t| t >= mtime) {
            return;
        }

        match WatcherConfig::load(path) {
            Ok(new_config) => {
                info!("Config changed on disk, reloading");
                self.update_config(new_config).await;
            }
            Err(e) => warn!("Failed to reload updated config: {e:#}"),
        }
        *last_mtime = Some(mtime);
    }
}
