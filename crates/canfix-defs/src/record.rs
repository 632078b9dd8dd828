//! Runtime configuration records
//!
//! A [`ConfigRecord`] pairs a configuration item descriptor with the value
//! read from (or about to be written to) a node. Dependent records follow
//! their parent: when the parent's value changes the record re-selects the
//! matching descriptor variant.

use std::collections::HashMap;

use thiserror::Error;

use crate::device::{ConfigControl, ConfigItem, DeviceDefinition, InputKind};
use crate::error::DefsError;
use crate::types::{DataType, Value};

/// Why a value was refused by a configuration record
#[derive(Debug, Error)]
pub enum Rejection {
    /// Dependent item whose parent value matches no variant
    #[error("key {key} has no definition for the current value of key {parent_key}")]
    Unresolved { key: u16, parent_key: u16 },

    #[error("'{0}' is not one of the allowed selections")]
    NotASelection(String),

    #[error("value {value} is not allowed: {reason}")]
    Invalid { value: String, reason: String },

    #[error(transparent)]
    Conversion(#[from] DefsError),

    #[error("unknown configuration key {0}")]
    UnknownKey(u16),
}

/// Validate a value against a control, clamping numbers into [min, max]
pub fn validate(control: &ConfigControl, value: Value) -> Result<Value, Rejection> {
    if control.input == InputKind::List && !control.selections.is_empty() {
        let allowed = control
            .selections
            .values()
            .any(|s| value.as_f64() == Some(*s as f64));
        if !allowed {
            return Err(Rejection::NotASelection(value.to_string()));
        }
        return Ok(value);
    }

    // Encoding proves the value fits the wire type
    match (&value, control.datatype) {
        (Value::Text(_), DataType::Char) | (Value::Bits(_), DataType::Byte | DataType::Word) => {
            control.datatype.encode(&value, control.multiplier)?;
            return Ok(value);
        }
        (Value::Text(_) | Value::Bits(_), _) => {
            return Err(Rejection::Invalid {
                value: value.to_string(),
                reason: format!("expected a number for {}", control.datatype),
            });
        }
        _ => {}
    }

    let Some(mut n) = value.as_f64() else {
        return Err(Rejection::Invalid {
            value: value.to_string(),
            reason: "not a number".to_string(),
        });
    };
    if let Some(min) = control.min {
        n = n.max(min);
    }
    if let Some(max) = control.max {
        n = n.min(max);
    }

    let clamped = match value {
        Value::Int(_) if n.fract() == 0.0 => Value::Int(n as i64),
        _ => Value::Float(n),
    };
    control.datatype.encode(&clamped, control.multiplier)?;
    Ok(clamped)
}

/// One configuration key with its live value
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    item: ConfigItem,
    value: Option<Value>,
    dirty: bool,
    parent_value: Option<Value>,
}

impl ConfigRecord {
    pub fn new(item: ConfigItem) -> Self {
        Self {
            item,
            value: None,
            dirty: false,
            parent_value: None,
        }
    }

    pub fn key(&self) -> u16 {
        self.item.key
    }

    pub fn item(&self) -> &ConfigItem {
        &self.item
    }

    /// The descriptor variant currently in force
    pub fn control(&self) -> Option<&ConfigControl> {
        self.item.control_for(self.parent_value.as_ref())
    }

    pub fn name(&self) -> &str {
        self.control().map(|c| c.name.as_str()).unwrap_or("-")
    }

    pub fn units(&self) -> &str {
        self.control().map(|c| c.units.as_str()).unwrap_or("")
    }

    pub fn datatype(&self) -> Option<DataType> {
        self.control().map(|c| c.datatype)
    }

    pub fn multiplier(&self) -> f64 {
        self.control().map(|c| c.multiplier).unwrap_or(1.0)
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Edited locally but not yet sent
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn parent_value(&self) -> Option<&Value> {
        self.parent_value.as_ref()
    }

    pub fn set_parent_value(&mut self, value: Option<Value>) {
        self.parent_value = value;
    }

    /// Store a value read from the node
    pub fn load_value(&mut self, value: Value) {
        self.value = Some(value);
        self.dirty = false;
    }

    /// Validate and store a locally edited value
    pub fn set_value(&mut self, value: Value) -> Result<Value, Rejection> {
        let control = self.control().ok_or_else(|| self.unresolved())?;
        let valid = validate(control, value)?;
        self.value = Some(valid.clone());
        self.dirty = true;
        Ok(valid)
    }

    /// Parse user text (or a selection label) and store it
    pub fn parse_and_set(&mut self, text: &str) -> Result<Value, Rejection> {
        let control = self.control().ok_or_else(|| self.unresolved())?;
        let value = match control.selections.get(text.trim()) {
            Some(v) => Value::Int(*v),
            None => control.datatype.parse_value(text)?,
        };
        self.set_value(value)
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Selection label for the current value, if any
    pub fn selection_label(&self) -> Option<&str> {
        let control = self.control()?;
        let v = self.value.as_ref()?.as_f64()?;
        control
            .selections
            .iter()
            .find(|(_, s)| **s as f64 == v)
            .map(|(label, _)| label.as_str())
    }

    fn unresolved(&self) -> Rejection {
        Rejection::Unresolved {
            key: self.item.key,
            parent_key: self.item.parent_key().unwrap_or_default(),
        }
    }
}

/// All configuration records of one device, linked parent → dependents
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    records: Vec<ConfigRecord>,
    index: HashMap<u16, usize>,
    children: HashMap<u16, Vec<u16>>,
}

impl ConfigSet {
    pub fn for_device(device: &DeviceDefinition) -> Self {
        Self::from_items(device.configuration.iter().cloned())
    }

    pub fn from_items(items: impl IntoIterator<Item = ConfigItem>) -> Self {
        let records: Vec<ConfigRecord> = items.into_iter().map(ConfigRecord::new).collect();
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key(), i))
            .collect();
        let mut children: HashMap<u16, Vec<u16>> = HashMap::new();
        for r in &records {
            if let Some(parent) = r.item.parent_key() {
                children.entry(parent).or_default().push(r.key());
            }
        }
        Self {
            records,
            index,
            children,
        }
    }

    pub fn records(&self) -> &[ConfigRecord] {
        &self.records
    }

    pub fn get(&self, key: u16) -> Option<&ConfigRecord> {
        self.index.get(&key).map(|i| &self.records[*i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Store a value read from the node and update dependents
    pub fn load_value(&mut self, key: u16, value: Value) -> Result<(), Rejection> {
        let i = *self.index.get(&key).ok_or(Rejection::UnknownKey(key))?;
        self.records[i].load_value(value.clone());
        self.propagate(key, value);
        Ok(())
    }

    /// Validate and store an edited value and update dependents
    pub fn set_value(&mut self, key: u16, value: Value) -> Result<Value, Rejection> {
        let i = *self.index.get(&key).ok_or(Rejection::UnknownKey(key))?;
        let valid = self.records[i].set_value(value)?;
        self.propagate(key, valid.clone());
        Ok(valid)
    }

    /// Parse user text for a key, store it and update dependents
    pub fn parse_and_set(&mut self, key: u16, text: &str) -> Result<Value, Rejection> {
        let i = *self.index.get(&key).ok_or(Rejection::UnknownKey(key))?;
        let valid = self.records[i].parse_and_set(text)?;
        self.propagate(key, valid.clone());
        Ok(valid)
    }

    pub fn dirty(&self) -> impl Iterator<Item = &ConfigRecord> {
        self.records.iter().filter(|r| r.is_dirty())
    }

    pub fn mark_clean(&mut self, key: u16) {
        if let Some(i) = self.index.get(&key) {
            self.records[*i].mark_clean();
        }
    }

    fn propagate(&mut self, key: u16, value: Value) {
        let Some(children) = self.children.get(&key) else {
            return;
        };
        for child in children {
            if let Some(i) = self.index.get(child) {
                self.records[*i].set_parent_value(Some(value.clone()));
            }
        }
    }
}
