//! Link configuration management

use crate::stream::TransferSettings;
use crate::usb::filter::DeviceFilter;
use anyhow::{Context, Result, anyhow};
use common::Role;
use protocol::MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub link: LinkSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub permission: PermissionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Streaming role of this peer
    pub role: Role,
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns of devices to use (empty = any device)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Interface to stream over (default: first with a bulk IN/OUT pair)
    #[serde(default)]
    pub interface: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Timeout for each bulk write in milliseconds
    #[serde(default = "TransferConfig::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Timeout for each bulk read in milliseconds; also bounds stop latency
    #[serde(default = "TransferConfig::default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Largest frame sent or reassembled
    #[serde(default = "TransferConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: Self::default_write_timeout(),
            read_timeout_ms: Self::default_read_timeout(),
            max_frame_bytes: Self::default_max_frame_bytes(),
        }
    }
}

impl TransferConfig {
    const MAX_READ_TIMEOUT_MS: u64 = 100;

    fn default_write_timeout() -> u64 {
        1000
    }

    fn default_read_timeout() -> u64 {
        50
    }

    fn default_max_frame_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub fn settings(&self) -> TransferSettings {
        TransferSettings {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Stands in for an OS consent dialog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// Grant every device without asking
    #[serde(default)]
    pub auto_grant: bool,
    /// VID:PID patterns granted when `auto_grant` is off
    #[serde(default)]
    pub approved_devices: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link: LinkSettings {
                role: Role::Receiver,
                log_level: "info".to_string(),
            },
            usb: UsbSettings::default(),
            transfer: TransferConfig::default(),
            permission: PermissionSettings::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from the specified path, or the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let p = Self::default_path();
                if !p.exists() {
                    return Err(anyhow!("No configuration file found at {}", p.display()));
                }
                p
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: LinkConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-frame-link").join("link.toml")
        } else {
            PathBuf::from(".config/usb-frame-link/link.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.link.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.link.log_level,
                valid_levels.join(", ")
            ));
        }

        Self::parse_filters(&self.usb.filters)?;
        Self::parse_filters(&self.permission.approved_devices)?;

        let read = self.transfer.read_timeout_ms;
        if read == 0 || read > TransferConfig::MAX_READ_TIMEOUT_MS {
            return Err(anyhow!(
                "Invalid read_timeout_ms {}, must be between 1 and {}",
                read,
                TransferConfig::MAX_READ_TIMEOUT_MS
            ));
        }

        if self.transfer.write_timeout_ms == 0 {
            return Err(anyhow!("write_timeout_ms must be greater than 0"));
        }

        let max = self.transfer.max_frame_bytes;
        if max == 0 || max > MAX_FRAME_LEN {
            return Err(anyhow!(
                "Invalid max_frame_bytes {}, must be between 1 and {}",
                max,
                MAX_FRAME_LEN
            ));
        }

        Ok(())
    }

    /// Device filters from `[usb]`
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        Self::parse_filters(&self.usb.filters)
    }

    /// Approved devices from `[permission]`
    pub fn approved_devices(&self) -> Result<Vec<DeviceFilter>> {
        Self::parse_filters(&self.permission.approved_devices)
    }

    fn parse_filters(patterns: &[String]) -> Result<Vec<DeviceFilter>> {
        patterns
            .iter()
            .map(|p| p.parse::<DeviceFilter>().map_err(anyhow::Error::from))
            .collect()
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<LinkConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    LinkConfig::load(Some(path_buf))
}
