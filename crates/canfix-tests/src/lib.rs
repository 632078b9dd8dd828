//! Integration tests for the CAN-FIX network stack
//!
//! The tests run the library against a mock bus with a simulated node
//! attached, so no CAN hardware or vcan interface is needed:
//!
//! ```bash
//! cargo test -p canfix-tests
//! ```
//!
//! # Test Structure
//!
//! - `tracker_test.rs` - node and parameter discovery
//! - `exchange_test.rs` - identification and configuration round trips
//! - `firmware_test.rs` - package decoding and both transfer drivers

use std::io::Write;
use std::sync::Arc;

use canfix_defs::{DeviceDefinition, DeviceStore};
use canfix_net::testing::{SimulatedNode, SimulatedNodeConfig};
use canfix_net::{CanBus, ExchangeConfig, MockBusAdapter, NodeExchange};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Node id used by our side in every test
pub const OWN_NODE: u8 = 0xFF;

/// Device definition matching [`SimulatedNodeConfig::default`]'s identity
pub const DEVICE_JSON: &str = r#"{
    "name": "Test Engine Monitor",
    "type": "0x30",
    "model": 1,
    "version": 1,
    "firmware_code": "0x5A5A",
    "firmware_driver": "CANFIX",
    "parameters": ["0x183"],
    "configuration": [
        {"key": 16, "name": "Fuel Tank Size", "type": "UINT", "units": "gal",
         "multiplier": 0.1, "min": 0, "max": 200},
        {"key": 17, "name": "Units", "type": "USHORT", "input": "list",
         "selections": {"Imperial": 0, "Metric": 1}},
        {"key": 18, "depends": {"key": 17, "definitions": [
            {"compare": 0, "name": "Capacity", "type": "UINT", "units": "gal"},
            {"compare": 1, "name": "Capacity", "type": "UINT", "units": "l"}
        ]}}
    ]
}"#;

/// Mock bus with one simulated node on it
pub struct Harness {
    pub mock: Arc<MockBusAdapter>,
    pub bus: Arc<CanBus>,
    pub store: Arc<DeviceStore>,
    pub node: SimulatedNode,
}

impl Harness {
    pub fn start(config: SimulatedNodeConfig) -> Self {
        let mock = Arc::new(MockBusAdapter::default());
        let bus = Arc::new(CanBus::with_adapter(mock.clone(), 256));
        let node = SimulatedNode::start(mock.clone(), config);
        Self {
            mock,
            bus,
            store: Arc::new(device_store()),
            node,
        }
    }

    pub fn exchange(&self) -> NodeExchange {
        NodeExchange::new(
            self.bus.clone(),
            ExchangeConfig {
                node_id: OWN_NODE,
                response_timeout_ms: 300,
            },
        )
    }
}

pub fn device_definition() -> DeviceDefinition {
    serde_json::from_str(DEVICE_JSON).expect("test device definition")
}

pub fn device_store() -> DeviceStore {
    let store = DeviceStore::new();
    store.register(device_definition());
    store
}

/// Uncompressed tar archive of `(name, contents)` members
pub fn tar_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("append tar member");
    }
    builder.into_inner().expect("finish tar archive")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Package with one `hex` file per payload, each at its own offset
pub fn hex_package(payloads: &[(&[u8], u32, u32)]) -> Vec<u8> {
    let names: Vec<String> = (0..payloads.len()).map(|n| format!("part{}.txt", n)).collect();
    let files: Vec<serde_json::Value> = payloads
        .iter()
        .zip(&names)
        .map(|((_, offset, block_size), name)| {
            serde_json::json!({
                "type": "hex",
                "name": name,
                "offset": offset,
                "block type": 1,
                "subsystem": 0,
                "block size": block_size,
            })
        })
        .collect();
    let index = serde_json::json!({ "files": files }).to_string();
    let texts: Vec<String> = payloads
        .iter()
        .map(|(data, _, _)| {
            data.iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    let mut members: Vec<(&str, &[u8])> = vec![("index.json", index.as_bytes())];
    for (name, text) in names.iter().zip(&texts) {
        members.push((name.as_str(), text.as_bytes()));
    }
    gzip(&tar_archive(&members))
}

/// Deterministic test image
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
