//! Tracked node state

use std::sync::Arc;
use std::time::Instant;

use canfix_defs::{DeviceDefinition, DeviceStore};

use super::TrackerError;

/// Size of the assembled node description
pub const DESCRIPTION_LEN: usize = 256;

/// One node seen on the bus
///
/// Identity fields stay `None` until the node answers an identification
/// request. The device definition is resolved as soon as all three are known.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: u8,
    pub device_type: Option<u8>,
    pub model: Option<u32>,
    pub firmware_version: Option<u8>,
    pub device: Option<Arc<DeviceDefinition>>,
    pub status: u32,
    pub last_seen: Instant,
    description: Vec<u8>,
}

impl Node {
    pub fn new(node_id: u8, now: Instant) -> Self {
        Self {
            node_id,
            device_type: None,
            model: None,
            firmware_version: None,
            device: None,
            status: 0,
            last_seen: now,
            description: vec![0; DESCRIPTION_LEN],
        }
    }

    /// Definition name, or "Unknown Device" until resolved
    pub fn name(&self) -> &str {
        self.device
            .as_ref()
            .map(|d| d.name.as_str())
            .unwrap_or("Unknown Device")
    }

    pub fn status_text(&self) -> String {
        if self.status == 0 {
            "OK".to_string()
        } else {
            format!("Error {}", self.status)
        }
    }

    /// Model number as upper-case hex
    pub fn model_hex(&self) -> Option<String> {
        self.model.map(|m| format!("{:X}", m))
    }

    /// Description text up to the first NUL
    pub fn description(&self) -> String {
        self.description
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect()
    }

    /// Store a 4-byte description fragment at `packet * 4`
    pub fn set_description(&mut self, packet: u16, chars: &[u8]) -> Result<(), TrackerError> {
        let start = packet as usize * 4;
        let end = start + chars.len();
        if end > DESCRIPTION_LEN {
            return Err(TrackerError::DescriptionOutOfRange {
                node: self.node_id,
                packet,
            });
        }
        self.description[start..end].copy_from_slice(chars);
        Ok(())
    }

    pub fn set_device_type(&mut self, device_type: u8, store: &DeviceStore) {
        self.device_type = Some(device_type);
        self.resolve(store);
    }

    pub fn set_model(&mut self, model: u32, store: &DeviceStore) {
        self.model = Some(model);
        self.resolve(store);
    }

    pub fn set_firmware_version(&mut self, version: u8, store: &DeviceStore) {
        self.firmware_version = Some(version);
        self.resolve(store);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    fn resolve(&mut self, store: &DeviceStore) {
        if let (Some(t), Some(m), Some(v)) = (self.device_type, self.model, self.firmware_version)
        {
            if let Some(def) = store.find(t, m, v) {
                self.device = Some(def);
            }
        }
    }
}
