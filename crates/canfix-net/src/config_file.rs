//! Node configuration save and restore
//!
//! A saved configuration is a JSON document holding the node identity and
//! every configuration key's value with the datatype and multiplier used to
//! read it, so it can be written back without the device definition.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use canfix_defs::{ConfigSet, DataType, DeviceKey, DeviceStore, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::exchange::{ExchangeError, NodeExchange};
use crate::protocol::NodeIdentity;

/// File format revision written and accepted
pub const CFG_VERSION: &str = "1.0";

/// Attempts per key before giving up on it
const ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("node {0} not found")]
    NodeNotFound(u8),

    #[error("no device definition for {0}")]
    UnknownDevice(DeviceKey),

    #[error("unknown configuration file version '{0}'")]
    UnknownFile(String),

    #[error("{field} mismatch: file has {file}, node reports {node}")]
    Mismatch {
        field: &'static str,
        file: u32,
        node: u32,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConfigFileResult<T> = Result<T, ConfigFileError>;

/// One saved key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedItem {
    pub name: String,
    #[serde(rename = "type")]
    pub datatype: DataType,
    pub multiplier: f64,
    pub value: Value,
}

/// Saved configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedConfiguration {
    #[serde(rename = "cfgVersion", deserialize_with = "de_version")]
    pub cfg_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub device: u8,
    pub model: u32,
    pub version: u8,
    pub saved: DateTime<Utc>,
    pub items: BTreeMap<u16, SavedItem>,
}

impl SavedConfiguration {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigFileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&content)?;
        if cfg.cfg_version != CFG_VERSION {
            return Err(ConfigFileError::UnknownFile(cfg.cfg_version));
        }
        Ok(cfg)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> ConfigFileResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check the file belongs to the identified node
    pub fn check_identity(&self, id: &NodeIdentity) -> ConfigFileResult<()> {
        let checks = [
            ("device type", self.device as u32, id.device_type as u32),
            ("model number", self.model, id.model),
            ("version number", self.version as u32, id.firmware_version as u32),
        ];
        for (field, file, node) in checks {
            if file != node {
                return Err(ConfigFileError::Mismatch { field, file, node });
            }
        }
        Ok(())
    }
}

/// Older files carry the version as a number
fn de_version<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => format!("{:.1}", f),
            None => n.to_string(),
        },
        other => other.to_string(),
    })
}

/// Progress notifications from a save or load
#[derive(Debug, Clone, PartialEq)]
pub enum TransferNotice {
    Status(String),
    /// Fraction complete, 0.0 to 1.0
    Progress(f32),
}

/// Result of writing a saved configuration to a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub written: usize,
    pub failed: Vec<u16>,
}

/// Saves and restores node configurations over an exchange
pub struct ConfigTransfer {
    exchange: NodeExchange,
    store: Arc<DeviceStore>,
    notices: Option<mpsc::UnboundedSender<TransferNotice>>,
}

impl ConfigTransfer {
    pub fn new(exchange: NodeExchange, store: Arc<DeviceStore>) -> Self {
        Self {
            exchange,
            store,
            notices: None,
        }
    }

    /// Receive status and progress while the transfer runs
    pub fn with_notices(mut self, tx: mpsc::UnboundedSender<TransferNotice>) -> Self {
        self.notices = Some(tx);
        self
    }

    /// Read every configuration key of a node
    pub async fn read_configuration(&self, dest: u8) -> ConfigFileResult<SavedConfiguration> {
        let id = self.identify(dest).await?;
        let key = DeviceKey::new(id.device_type, id.model, id.firmware_version);
        let device = self
            .store
            .get(&key)
            .ok_or(ConfigFileError::UnknownDevice(key))?;

        let mut records = ConfigSet::for_device(&device);
        let keys: Vec<u16> = records.records().iter().map(|r| r.key()).collect();
        let total = keys.len().max(1);
        let mut items = BTreeMap::new();

        for (n, key) in keys.into_iter().enumerate() {
            let Some(record) = records.get(key) else {
                continue;
            };
            let (Some(datatype), name, multiplier) =
                (record.datatype(), record.name().to_string(), record.multiplier())
            else {
                self.status(format!("Skipping - {} - no definition for parent value", key));
                continue;
            };

            self.status(format!("Saving - {} - {}", key, name));
            match self.query_with_retry(dest, key, datatype, multiplier).await? {
                Some(value) => {
                    // Dependent keys later in the list resolve against this value
                    if let Err(e) = records.load_value(key, value.clone()) {
                        warn!(node = dest, key, error = %e, "Read value not applied to dependent keys");
                    }
                    items.insert(
                        key,
                        SavedItem {
                            name,
                            datatype,
                            multiplier,
                            value,
                        },
                    );
                }
                None => {
                    warn!(node = dest, key, "Configuration key could not be read");
                    self.status(format!("Error reading configuration key {}", key));
                }
            }
            self.progress((n + 1) as f32 / total as f32);
        }

        self.progress(1.0);
        self.status("Finished".to_string());
        Ok(SavedConfiguration {
            cfg_version: CFG_VERSION.to_string(),
            name: Some(device.name.clone()),
            device: id.device_type,
            model: id.model,
            version: id.firmware_version,
            saved: Utc::now(),
            items,
        })
    }

    /// Read every configuration key of a node and write them to `path`
    pub async fn save_configuration(
        &self,
        dest: u8,
        path: impl AsRef<Path>,
    ) -> ConfigFileResult<SavedConfiguration> {
        let cfg = self.read_configuration(dest).await?;
        cfg.write(path.as_ref())?;
        info!(node = dest, items = cfg.items.len(), path = %path.as_ref().display(), "Configuration saved");
        Ok(cfg)
    }

    /// Write a saved configuration file back to a node
    pub async fn load_configuration(
        &self,
        dest: u8,
        path: impl AsRef<Path>,
    ) -> ConfigFileResult<LoadSummary> {
        let cfg = match SavedConfiguration::from_file(path.as_ref()) {
            Ok(cfg) => cfg,
            Err(e) => {
                self.status("Unknown configuration file".to_string());
                return Err(e);
            }
        };
        self.write_configuration(dest, &cfg).await
    }

    /// Write every saved key to a node after checking its identity
    pub async fn write_configuration(
        &self,
        dest: u8,
        cfg: &SavedConfiguration,
    ) -> ConfigFileResult<LoadSummary> {
        let id = self.identify(dest).await?;
        if let Err(e) = cfg.check_identity(&id) {
            self.status(e.to_string());
            return Err(e);
        }

        let total = cfg.items.len().max(1);
        let mut summary = LoadSummary::default();
        for (n, (key, item)) in cfg.items.iter().enumerate() {
            self.status(format!("Sending Key {}", key));
            if self.set_with_retry(dest, *key, item).await? {
                summary.written += 1;
            } else {
                warn!(node = dest, key, "Configuration key could not be written");
                self.status(format!("Error writing configuration key {}", key));
                summary.failed.push(*key);
            }
            self.progress((n + 1) as f32 / total as f32);
        }

        self.progress(1.0);
        self.status("Finished".to_string());
        info!(node = dest, written = summary.written, failed = summary.failed.len(), "Configuration loaded");
        Ok(summary)
    }

    async fn identify(&self, dest: u8) -> ConfigFileResult<NodeIdentity> {
        match self.exchange.get_node_information(dest).await? {
            Some(id) => Ok(id),
            None => {
                self.status("Node Not Found".to_string());
                Err(ConfigFileError::NodeNotFound(dest))
            }
        }
    }

    async fn query_with_retry(
        &self,
        dest: u8,
        key: u16,
        datatype: DataType,
        multiplier: f64,
    ) -> ConfigFileResult<Option<Value>> {
        for attempt in 1..=ATTEMPTS {
            match self.exchange.query_value(dest, key, datatype, multiplier).await {
                Ok(Some(v)) => return Ok(Some(v)),
                Ok(None) => warn!(node = dest, key, attempt, "No response to configuration query"),
                Err(ExchangeError::Status { text, .. }) => {
                    warn!(node = dest, key, status = %text, "Configuration query refused");
                    return Ok(None);
                }
                Err(ExchangeError::Value(e)) => {
                    warn!(node = dest, key, error = %e, "Configuration value undecodable");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn set_with_retry(&self, dest: u8, key: u16, item: &SavedItem) -> ConfigFileResult<bool> {
        for attempt in 1..=ATTEMPTS {
            let resp = self
                .exchange
                .set_node_configuration(dest, key, item.datatype, item.multiplier, &item.value)
                .await;
            match resp {
                Ok(Some(r)) if r.is_ok() => return Ok(true),
                Ok(Some(r)) => {
                    warn!(node = dest, key, status = %r.status_text(), "Configuration set refused");
                    return Ok(false);
                }
                Ok(None) => warn!(node = dest, key, attempt, "No response to configuration set"),
                Err(ExchangeError::Value(e)) => {
                    warn!(node = dest, key, error = %e, "Saved value does not fit its type");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    fn status(&self, text: String) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(TransferNotice::Status(text));
        }
    }

    fn progress(&self, fraction: f32) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(TransferNotice::Progress(fraction.clamp(0.0, 1.0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SavedConfiguration {
        SavedConfiguration {
            cfg_version: CFG_VERSION.to_string(),
            name: Some("Engine Monitor".to_string()),
            device: 0x30,
            model: 1,
            version: 2,
            saved: Utc::now(),
            items: BTreeMap::from([
                (
                    16,
                    SavedItem {
                        name: "Fuel Tank Size".to_string(),
                        datatype: DataType::Uint,
                        multiplier: 0.1,
                        value: Value::Float(40.5),
                    },
                ),
                (
                    17,
                    SavedItem {
                        name: "Mode".to_string(),
                        datatype: DataType::Ushort,
                        multiplier: 1.0,
                        value: Value::Int(2),
                    },
                ),
            ]),
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let cfg = sample();
        cfg.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"cfgVersion\": \"1.0\""));
        assert!(text.contains("\"type\": \"UINT\""));

        let back = SavedConfiguration::from_file(&path).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_numeric_version_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        std::fs::write(
            &path,
            r#"{"cfgVersion": 1.0, "device": 48, "model": 1, "version": 2,
                "saved": "2024-01-01T00:00:00Z", "items": {}}"#,
        )
        .unwrap();
        assert!(SavedConfiguration::from_file(&path).is_ok());

        std::fs::write(
            &path,
            r#"{"cfgVersion": "2.0", "device": 48, "model": 1, "version": 2,
                "saved": "2024-01-01T00:00:00Z", "items": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            SavedConfiguration::from_file(&path),
            Err(ConfigFileError::UnknownFile(v)) if v == "2.0"
        ));
    }

    #[test]
    fn test_identity_check() {
        let cfg = sample();
        let good = NodeIdentity {
            device_type: 0x30,
            model: 1,
            firmware_version: 2,
        };
        assert!(cfg.check_identity(&good).is_ok());
        let bad = NodeIdentity {
            firmware_version: 3,
            ..good
        };
        assert!(matches!(
            cfg.check_identity(&bad),
            Err(ConfigFileError::Mismatch { field: "version number", file: 2, node: 3 })
        ));
    }
}
