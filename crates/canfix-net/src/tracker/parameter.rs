//! Tracked parameter state

use std::collections::BTreeMap;
use std::time::Instant;

use canfix_defs::{catalog, DataType, Value};

use super::TrackerError;
use crate::protocol::ParameterFrame;

/// One (parameter id, index) seen on the bus
#[derive(Debug, Clone)]
pub struct Parameter {
    pub id: u16,
    pub index: u8,
    pub node: u8,
    /// Index-qualified display name
    pub name: String,
    pub datatype: Option<DataType>,
    pub multiplier: f64,
    pub units: String,
    pub value: Option<Value>,
    /// Formatted value with units
    pub value_text: String,
    pub annunciate: bool,
    pub quality: bool,
    pub failure: bool,
    /// Latest raw bytes per metadata slot
    pub meta: BTreeMap<u8, Vec<u8>>,
    pub last_seen: Instant,
}

impl Parameter {
    pub fn new(id: u16, index: u8, node: u8, now: Instant) -> Self {
        let spec = catalog::lookup(id);
        let name = match spec {
            Some(s) => match s.index_name {
                Some(index_name) => format!("{} {} #{}", s.name, index_name, index as u16 + 1),
                None => s.name.to_string(),
            },
            None => format!("Parameter 0x{:03X}", id),
        };
        Self {
            id,
            index,
            node,
            name,
            datatype: spec.map(|s| s.datatype),
            multiplier: spec.map(|s| s.multiplier).unwrap_or(1.0),
            units: spec.map(|s| s.units.to_string()).unwrap_or_default(),
            value: None,
            value_text: String::new(),
            annunciate: false,
            quality: false,
            failure: false,
            meta: BTreeMap::new(),
            last_seen: now,
        }
    }

    /// Quality flags as text, e.g. "Q F"
    pub fn quality_text(&self) -> String {
        [
            (self.annunciate, "A"),
            (self.quality, "Q"),
            (self.failure, "F"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, s)| *s)
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Apply a frame, returning true if the value or quality changed
    ///
    /// Metadata frames only refresh the metadata map. A frame that does not
    /// decode leaves the parameter untouched.
    pub fn update(&mut self, frame: &ParameterFrame, now: Instant) -> Result<bool, TrackerError> {
        let meta = frame.function.meta();
        if meta != 0 {
            self.last_seen = now;
            self.node = frame.node;
            self.meta.insert(meta, frame.data.clone());
            return Ok(false);
        }

        let value = match self.datatype {
            Some(dt) => dt.decode(&frame.data, self.multiplier)?,
            None => Value::Text(hex::encode_upper(&frame.data)),
        };
        self.last_seen = now;
        self.node = frame.node;
        let flags = (
            frame.function.annunciate(),
            frame.function.quality(),
            frame.function.failure(),
        );

        let changed =
            self.value.as_ref() != Some(&value) || (self.annunciate, self.quality, self.failure) != flags;
        if changed {
            self.value_text = value.format_with_units(self.multiplier, &self.units);
            self.value = Some(value);
            (self.annunciate, self.quality, self.failure) = flags;
        }
        Ok(changed)
    }
}
