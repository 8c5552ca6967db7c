//! Bridge configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub midi: MidiSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor id of the grid controller.
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: u16,
    /// USB product id of the grid controller.
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiSettings {
    /// Client name the virtual ports register under.
    #[serde(default = "MidiSettings::default_client_name")]
    pub client_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DeviceSettings {
    fn default_vendor_id() -> u16 {
        0x1235
    }

    fn default_product_id() -> u16 {
        0x000E
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
        }
    }
}

impl MidiSettings {
    fn default_client_name() -> String {
        "gridpad".to_string()
    }
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self { client_name: Self::default_client_name() }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            midi: MidiSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("gridpad").join("bridge.toml")
        } else {
            PathBuf::from("/etc/gridpad/bridge.toml")
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Load from the default location, falling back to built-in
    /// defaults when no file exists.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("ignoring unreadable config: {:#}", e),
            }
        }
        Self::default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }
}
