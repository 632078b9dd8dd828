//! Device definition structures
//!
//! A device definition describes one kind of CAN-FIX node, identified by
//! (device type, model, version): the parameters it publishes, how its
//! firmware is updated and which configuration keys it accepts.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{int_from_json, DefsError};
use crate::types::{DataType, Value};

/// Identity triple reported by node identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub device_type: u8,
    pub model: u32,
    pub version: u8,
}

impl DeviceKey {
    pub fn new(device_type: u8, model: u32, version: u8) -> Self {
        Self {
            device_type,
            model,
            version,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type=0x{:02X}, model={:06X}, version={}",
            self.device_type, self.model, self.version
        )
    }
}

/// Complete definition for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Human-readable name
    pub name: String,

    #[serde(rename = "type", deserialize_with = "de_int")]
    pub device_type: u8,

    #[serde(deserialize_with = "de_int")]
    pub model: u32,

    #[serde(deserialize_with = "de_int")]
    pub version: u8,

    /// Verification code sent with the firmware update request
    #[serde(default, deserialize_with = "de_opt_int", skip_serializing_if = "Option::is_none")]
    pub firmware_code: Option<u16>,

    /// Name of the firmware transfer driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_driver: Option<String>,

    /// Parameter ids the device publishes, kept sorted
    #[serde(default, deserialize_with = "de_int_list")]
    pub parameters: Vec<u16>,

    /// Configuration keys in display order
    #[serde(default)]
    pub configuration: Vec<ConfigItem>,
}

impl DeviceDefinition {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.device_type, self.model, self.version)
    }

    /// Look up a configuration item by key
    pub fn config_item(&self, key: u16) -> Option<&ConfigItem> {
        self.configuration.iter().find(|c| c.key == key)
    }

    /// Normalise after deserialisation
    pub(crate) fn finish(mut self) -> Self {
        self.parameters.sort_unstable();
        self.parameters.dedup();
        self
    }
}

impl fmt::Display for DeviceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.key())
    }
}

// =============================================================================
// Configuration items
// =============================================================================

/// How a value is entered by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Entry,
    /// Pick one of the item's selections
    List,
}

/// Presentation and validation rules for one configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigControl {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub datatype: DataType,

    #[serde(default)]
    pub input: InputKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default)]
    pub units: String,

    /// Label → value for list inputs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selections: BTreeMap<String, i64>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for ConfigControl {
    fn default() -> Self {
        Self {
            name: String::new(),
            datatype: DataType::default(),
            input: InputKind::default(),
            min: None,
            max: None,
            multiplier: default_multiplier(),
            units: String::new(),
            selections: BTreeMap::new(),
        }
    }
}

/// Parent value(s) that select a dependent variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Compare {
    One(f64),
    Many(Vec<f64>),
}

impl Compare {
    pub fn matches(&self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        match self {
            Compare::One(c) => *c == v,
            Compare::Many(cs) => cs.iter().any(|c| *c == v),
        }
    }
}

/// One variant of a dependent configuration item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVariant {
    pub compare: Compare,
    #[serde(flatten)]
    pub control: ConfigControl,
}

/// Descriptor shape: a fixed control, or variants keyed by a parent value
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigKind {
    Plain(ConfigControl),
    Dependent {
        parent_key: u16,
        variants: Vec<ConfigVariant>,
    },
}

/// One configuration key a device accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfigItem", into = "RawConfigItem")]
pub struct ConfigItem {
    pub key: u16,
    pub kind: ConfigKind,
}

impl ConfigItem {
    pub fn plain(key: u16, control: ConfigControl) -> Self {
        Self {
            key,
            kind: ConfigKind::Plain(control),
        }
    }

    pub fn parent_key(&self) -> Option<u16> {
        match &self.kind {
            ConfigKind::Plain(_) => None,
            ConfigKind::Dependent { parent_key, .. } => Some(*parent_key),
        }
    }

    /// Control for the given parent value
    ///
    /// Plain items ignore the parent value. Dependent items pick the last
    /// variant whose `compare` matches.
    pub fn control_for(&self, parent_value: Option<&Value>) -> Option<&ConfigControl> {
        match &self.kind {
            ConfigKind::Plain(c) => Some(c),
            ConfigKind::Dependent { variants, .. } => {
                let pv = parent_value?;
                variants
                    .iter()
                    .rev()
                    .find(|v| v.compare.matches(pv))
                    .map(|v| &v.control)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDepends {
    #[serde(deserialize_with = "de_int")]
    key: u16,
    definitions: Vec<ConfigVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfigItem {
    #[serde(deserialize_with = "de_int")]
    key: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depends: Option<RawDepends>,
    #[serde(flatten)]
    control: ConfigControl,
}

impl TryFrom<RawConfigItem> for ConfigItem {
    type Error = DefsError;

    fn try_from(raw: RawConfigItem) -> Result<Self, Self::Error> {
        let kind = match raw.depends {
            Some(dep) => {
                if dep.definitions.is_empty() {
                    return Err(DefsError::InvalidDefinition(format!(
                        "key {} depends on {} but has no definitions",
                        raw.key, dep.key
                    )));
                }
                ConfigKind::Dependent {
                    parent_key: dep.key,
                    variants: dep.definitions,
                }
            }
            None => ConfigKind::Plain(raw.control),
        };
        Ok(ConfigItem { key: raw.key, kind })
    }
}

impl From<ConfigItem> for RawConfigItem {
    fn from(item: ConfigItem) -> Self {
        match item.kind {
            ConfigKind::Plain(control) => RawConfigItem {
                key: item.key,
                depends: None,
                control,
            },
            ConfigKind::Dependent {
                parent_key,
                variants,
            } => RawConfigItem {
                key: item.key,
                depends: Some(RawDepends {
                    key: parent_key,
                    definitions: variants,
                }),
                control: ConfigControl::default(),
            },
        }
    }
}

// =============================================================================
// Integer fields that may be written as strings ("0x10")
// =============================================================================

fn de_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let i = int_from_json(&value).map_err(D::Error::custom)?;
    T::try_from(i).map_err(|_| D::Error::custom(format!("{} is out of range", i)))
}

fn de_opt_int<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let i = int_from_json(&v).map_err(D::Error::custom)?;
            T::try_from(i)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("{} is out of range", i)))
        }
    }
}

fn de_int_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    values
        .iter()
        .map(|v| {
            let i = int_from_json(v).map_err(D::Error::custom)?;
            T::try_from(i).map_err(|_| D::Error::custom(format!("{} is out of range", i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "name": "Air Data Computer",
            "type": "0x10",
            "model": "0x000001",
            "version": 3,
            "firmware_code": "0x0705",
            "firmware_driver": "CANFIX",
            "parameters": ["0x184", 0x183, "0x190"],
            "configuration": [
                {"key": 1, "name": "Baud", "type": "USHORT", "input": "list",
                 "selections": {"125k": 0, "250k": 1}},
                {"key": 2, "name": "Sensor Type", "type": "USHORT"},
                {"key": 3, "depends": {"key": 2, "definitions": [
                    {"compare": 0, "name": "Offset", "type": "INT", "multiplier": 0.1, "units": "ft"},
                    {"compare": [1, 2], "name": "Scale", "type": "FLOAT"}
                ]}}
            ]
        })
    }

    #[test]
    fn test_parse_definition() {
        let def: DeviceDefinition = serde_json::from_value(sample()).unwrap();
        let def = def.finish();
        assert_eq!(def.key(), DeviceKey::new(0x10, 1, 3));
        assert_eq!(def.firmware_code, Some(0x0705));
        assert_eq!(def.parameters, vec![0x183, 0x184, 0x190]);
        assert_eq!(def.configuration.len(), 3);

        let baud = def.config_item(1).unwrap();
        let control = baud.control_for(None).unwrap();
        assert_eq!(control.input, InputKind::List);
        assert_eq!(control.selections.get("250k"), Some(&1));
        assert_eq!(control.multiplier, 1.0);
    }

    #[test]
    fn test_dependent_item_selects_variant() {
        let def: DeviceDefinition = serde_json::from_value(sample()).unwrap();
        let item = def.config_item(3).unwrap();
        assert_eq!(item.parent_key(), Some(2));

        let offset = item.control_for(Some(&Value::Int(0))).unwrap();
        assert_eq!(offset.name, "Offset");
        assert_eq!(offset.datatype, DataType::Int);

        let scale = item.control_for(Some(&Value::Int(2))).unwrap();
        assert_eq!(scale.name, "Scale");

        assert!(item.control_for(Some(&Value::Int(9))).is_none());
        assert!(item.control_for(None).is_none());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let mut v = sample();
        v.as_object_mut().unwrap().remove("model");
        let result: Result<DeviceDefinition, _> = serde_json::from_value(v);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_hex_string_fails() {
        let mut v = sample();
        v["type"] = json!("0xZZ");
        let result: Result<DeviceDefinition, _> = serde_json::from_value(v);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_item_serialises_back() {
        let def: DeviceDefinition = serde_json::from_value(sample()).unwrap();
        let text = serde_json::to_string(&def.configuration).unwrap();
        let back: Vec<ConfigItem> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, def.configuration);
    }

    #[test]
    fn test_device_key_display() {
        assert_eq!(
            DeviceKey::new(0x10, 0x1A, 2).to_string(),
            "type=0x10, model=00001A, version=2"
        );
    }
}
