use crate::dispatch::DeviceParams;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_vid")]
    pub vid: String,
    #[serde(default = "default_pid")]
    pub pid: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vid: default_vid(),
            pid: default_pid(),
        }
    }
}

/// Watcher daemon configuration, replaced wholesale on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub device: DeviceConfig,
    /// Hue units moved per external step call.
    pub step: u8,
    pub delay_ms: u64,
    /// Persist the hue to EEPROM after each successful set.
    pub save_on_set: bool,
    /// Layout code (full or primary subtag) to color string.
    pub layout_colors: HashMap<String, String>,
    pub default_color: String,
    pub poll_interval_ms: u64,
    pub rate_limit_ms: u64,
    pub enabled: bool,
    /// Command run to probe the active layout; first stdout line is the
    /// layout code.
    pub layout_command: Vec<String>,
}

fn default_vid() -> String {
    "0x3434".to_string()
}

fn default_pid() -> String {
    "0x0011".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        let mut layout_colors = HashMap::new();
        layout_colors.insert("en".to_string(), "green".to_string());

        Self {
            device: DeviceConfig::default(),
            step: 8,
            delay_ms: 15,
            save_on_set: false,
            layout_colors,
            default_color: "red".to_string(),
            poll_interval_ms: 100,
            rate_limit_ms: 200,
            enabled: true,
            layout_command: vec!["xkb-switch".to_string()],
        }
    }
}

impl WatcherConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("via-hue/config.json"))
    }

    /// Loads the config file. Fails if it is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {path:?}"))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {path:?}"))?;

        Ok(config.sanitized())
    }

    /// Loads the config, writing a default file on first run. A corrupt
    /// file is an error rather than being overwritten.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        info!("Config file not found, creating defaults at {path:?}");
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {parent:?}"))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {path:?}"))?;
        info!("Config saved to {path:?}");
        Ok(())
    }

    /// Clamps nonsense values back to defaults.
    fn sanitized(mut self) -> Self {
        if self.step == 0 {
            warn!("step must be at least 1, using default");
            self.step = 8;
        }
        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms must be nonzero, using default");
            self.poll_interval_ms = 100;
        }
        if self.layout_command.is_empty() {
            warn!("layout_command is empty, using default");
            self.layout_command = vec!["xkb-switch".to_string()];
        }
        self
    }

    /// Resolves a layout code to its configured color string: exact match,
    /// then primary-subtag prefix match, then the default.
    pub fn color_for_layout(&self, layout: Option<&str>) -> &str {
        let Some(code) = layout else {
            return &self.default_color;
        };

        if let Some(color) = self.layout_colors.get(code) {
            return color;
        }

        let prefix = code.split('-').next().unwrap_or(code).to_ascii_lowercase();
        if let Some(color) = self.layout_colors.get(&prefix) {
            return color;
        }

        &self.default_color
    }

    pub fn device_params(&self) -> DeviceParams {
        DeviceParams {
            vid: self.device.vid.clone(),
            pid: self.device.pid.clone(),
            step: self.step,
            delay: Duration::from_millis(self.delay_ms),
            save: self.save_on_set,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}
