//! Configuration file handling for cfutil

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Bus interface type: socketcan or mock
    pub interface: Option<String>,
    /// CAN channel name
    pub channel: Option<String>,
    /// Bitrate in kbps
    pub bitrate: Option<u32>,
    /// Our node id on the network
    pub node: Option<u8>,
    /// Directory of device definition files
    pub device_dir: Option<PathBuf>,
    /// Default output format
    pub output: Option<String>,
    /// Seconds the nodes command listens for
    pub node_timeout: Option<u64>,
    /// Disable colored output
    pub no_color: Option<bool>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("cfutil");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &ArgOverrides) -> MergedConfig {
        MergedConfig {
            interface: args
                .interface
                .clone()
                .or_else(|| self.interface.clone())
                .unwrap_or_else(|| "socketcan".to_string()),
            channel: args
                .channel
                .clone()
                .or_else(|| self.channel.clone())
                .unwrap_or_else(|| "can0".to_string()),
            bitrate: args.bitrate.or(self.bitrate).unwrap_or(125),
            node: args.node.or(self.node).unwrap_or(0xFF),
            device_dir: args
                .device_dir
                .clone()
                .or_else(|| self.device_dir.clone())
                .or_else(default_device_dir),
            node_timeout: args.node_timeout.or(self.node_timeout).unwrap_or(3),
            no_color: args.no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ArgOverrides {
    pub interface: Option<String>,
    pub channel: Option<String>,
    pub bitrate: Option<u32>,
    pub node: Option<u8>,
    pub device_dir: Option<PathBuf>,
    pub node_timeout: Option<u64>,
    pub no_color: bool,
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub interface: String,
    pub channel: String,
    pub bitrate: u32,
    pub node: u8,
    pub device_dir: Option<PathBuf>,
    pub node_timeout: u64,
    pub no_color: bool,
}

fn default_device_dir() -> Option<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("cfutil").join("devices"))
        .filter(|d| d.is_dir())
}
