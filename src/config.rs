//! Application configuration loaded from YAML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cdp_adapter::CdpConfig;
use feed_patch::PatchConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cdp: CdpConfig,
    pub patch: PatchConfig,
    /// Capacity of the relay event bus.
    pub bus_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cdp: CdpConfig::default(),
            patch: PatchConfig::default(),
            bus_capacity: 256,
        }
    }
}

pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().context("Failed to get config directory")?;
    path.push("feedtap");
    path.push("config.yaml");
    Ok(path)
}

/// Reads `config_path`, or the per-user default location. A missing file
/// yields defaults.
pub async fn load_config(config_path: Option<&Path>) -> Result<LoadedConfig> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .await
            .context("Failed to read config file")?;
        let config: AppConfig =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;
        info!("Loaded configuration from: {}", config_path.display());
        Ok(LoadedConfig {
            config,
            path: config_path,
        })
    } else {
        warn!(
            "Config file not found, using defaults: {}",
            config_path.display()
        );
        Ok(LoadedConfig {
            config: AppConfig::default(),
            path: config_path,
        })
    }
}
