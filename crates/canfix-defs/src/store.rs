//! Device store - the container for device definitions
//!
//! Lookup is by the identity triple a node reports in its identification
//! response.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::device::{DeviceDefinition, DeviceKey};
use crate::error::DefsResult;

/// Outcome of loading a definitions directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Thread-safe store for device definitions
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: RwLock<HashMap<DeviceKey, Arc<DeviceDefinition>>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.json`, `.yaml` and `.yml` file in a directory
    pub fn from_dir(dir: impl AsRef<Path>) -> DefsResult<Self> {
        let store = Self::new();
        store.load_dir(dir)?;
        Ok(store)
    }

    /// Parse a JSON document holding one definition or a list of them
    pub fn from_json(json: &str) -> DefsResult<Self> {
        let store = Self::new();
        store.load_document(serde_json::from_str(json)?, "<json>");
        Ok(store)
    }

    /// Parse a YAML document holding one definition or a list of them
    pub fn from_yaml(yaml: &str) -> DefsResult<Self> {
        let store = Self::new();
        store.load_document(serde_yaml::from_str(yaml)?, "<yaml>");
        Ok(store)
    }

    /// Register a definition, replacing any with the same identity
    pub fn register(&self, def: DeviceDefinition) -> Arc<DeviceDefinition> {
        let def = Arc::new(def.finish());
        self.devices.write().insert(def.key(), def.clone());
        def
    }

    pub fn find(&self, device_type: u8, model: u32, version: u8) -> Option<Arc<DeviceDefinition>> {
        self.get(&DeviceKey::new(device_type, model, version))
    }

    pub fn get(&self, key: &DeviceKey) -> Option<Arc<DeviceDefinition>> {
        self.devices.read().get(key).cloned()
    }

    /// All definitions, ordered by identity
    pub fn list(&self) -> Vec<Arc<DeviceDefinition>> {
        let mut all: Vec<_> = self.devices.read().values().cloned().collect();
        all.sort_by_key(|d| d.key());
        all
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Load a definitions directory into this store
    ///
    /// Files or entries that fail to parse are logged and skipped.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> DefsResult<LoadReport> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            let origin = path.display().to_string();
            match self.load_file(&path) {
                Ok(r) => {
                    report.loaded += r.loaded;
                    report.skipped += r.skipped;
                }
                Err(e) => {
                    warn!(file = %origin, error = %e, "Skipping unreadable device file");
                    report.skipped += 1;
                }
            }
        }
        debug!(
            loaded = report.loaded,
            skipped = report.skipped,
            "Loaded device definitions"
        );
        Ok(report)
    }

    /// Load one definitions file into this store
    pub fn load_file(&self, path: impl AsRef<Path>) -> DefsResult<LoadReport> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(self.load_document(doc, &path.display().to_string()))
    }

    fn load_document(&self, doc: serde_json::Value, origin: &str) -> LoadReport {
        let entries = match doc {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        let mut report = LoadReport::default();
        for (i, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<DeviceDefinition>(entry) {
                Ok(def) => {
                    let def = self.register(def);
                    debug!(device = %def, "Registered device definition");
                    report.loaded += 1;
                }
                Err(e) => {
                    warn!(file = %origin, entry = i, error = %e, "Skipping invalid device definition");
                    report.skipped += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const EFIS: &str = r#"{
        "name": "Electronic Flight Information System",
        "type": "0x10",
        "model": "0x001A2B",
        "version": 2,
        "firmware_code": "0x1234",
        "firmware_driver": "CANFIX",
        "parameters": [386, "0x180", "0x181"],
        "configuration": [
            {"key": 1, "name": "Bitrate", "type": "USHORT", "input": "list",
             "selections": {"125k": 0, "250k": 1}}
        ]
    }"#;

    #[test]
    fn test_from_json_and_find() {
        let store = DeviceStore::from_json(EFIS).unwrap();
        assert_eq!(store.len(), 1);
        let def = store.find(0x10, 0x001A2B, 2).unwrap();
        assert_eq!(def.name, "Electronic Flight Information System");
        assert_eq!(def.parameters, vec![0x180, 0x181, 0x182]);
        assert_eq!(def.firmware_code, Some(0x1234));
        assert!(store.find(0x10, 0x001A2B, 3).is_none());
    }

    #[test]
    fn test_from_yaml_list() {
        let yaml = r#"
- name: Air Data Computer
  type: 0x20
  model: 1
  version: 1
- name: Engine Monitor
  type: "0x30"
  model: "0x10"
  version: 1
"#;
        let store = DeviceStore::from_yaml(yaml).unwrap();
        let names: Vec<String> = store.list().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["Air Data Computer", "Engine Monitor"]);
    }

    #[test]
    fn test_load_dir_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut good = std::fs::File::create(dir.path().join("efis.json")).unwrap();
        good.write_all(EFIS.as_bytes()).unwrap();

        // Second entry has no model
        std::fs::write(
            dir.path().join("mixed.json"),
            r#"[{"name": "A", "type": 1, "model": 1, "version": 1},
                {"name": "B", "type": 2, "version": 1}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: [unclosed").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = DeviceStore::new();
        let report = store.load_dir(dir.path()).unwrap();
        assert_eq!(report, LoadReport { loaded: 2, skipped: 2 });
        assert_eq!(store.len(), 2);
        assert!(store.find(1, 1, 1).is_some());
    }

    #[test]
    fn test_register_replaces_same_identity() {
        let store = DeviceStore::from_json(EFIS).unwrap();
        let mut def = (*store.find(0x10, 0x001A2B, 2).unwrap()).clone();
        def.name = "EFIS".to_string();
        store.register(def);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find(0x10, 0x001A2B, 2).unwrap().name, "EFIS");
    }

    #[test]
    fn test_missing_dir_is_error() {
        let store = DeviceStore::new();
        assert!(store.load_dir("/nonexistent/canfix/devices").is_err());
    }
}
