//! Command implementations for cfutil

pub mod configuration;
pub mod devices;
pub mod firmware;
pub mod info;
pub mod listen;
pub mod nodes;
pub mod transfer;

pub use configuration::{query, set};
pub use devices::devices;
pub use firmware::{firmware, FirmwareArgs};
pub use info::info;
pub use listen::listen;
pub use nodes::nodes;
pub use transfer::{load, save};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use canfix_defs::{ConfigSet, DeviceDefinition, DeviceStore};
use canfix_net::testing::{SimulatedNode, SimulatedNodeConfig};
use canfix_net::{
    BusConfig, CanBus, ExchangeConfig, FirmwareDriver, MockBusAdapter, MockConfig, NodeExchange,
    NodeIdentity, SocketCanConfig, TransportConfig,
};
use tracing::{debug, info};

use crate::config::MergedConfig;

/// Definition of the node simulated on the mock interface
const MOCK_DEVICE: &str = r#"{
    "name": "Simulated Engine Monitor",
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
         "selections": {"Imperial": 0, "Metric": 1}}
    ]
}"#;

const MOCK_NODE: u8 = 0x20;

/// Bus, device definitions and settings shared by every command
pub struct Session {
    pub bus: Arc<CanBus>,
    pub store: Arc<DeviceStore>,
    pub node: u8,
    _simulated: Option<SimulatedNode>,
}

impl Session {
    pub async fn open(config: &MergedConfig) -> Result<Self> {
        let store = match &config.device_dir {
            Some(dir) => DeviceStore::from_dir(dir)
                .with_context(|| format!("Failed to load device definitions from {}", dir.display()))?,
            None => DeviceStore::new(),
        };
        debug!(devices = store.len(), "Device definitions loaded");

        let (bus, simulated) = match config.interface.as_str() {
            "mock" => {
                let mock = Arc::new(MockBusAdapter::new(&MockConfig::default()));
                let device: DeviceDefinition = serde_json::from_str(MOCK_DEVICE)?;
                store.register(device);
                let sim = SimulatedNode::start(mock.clone(), mock_node_config());
                info!(node = MOCK_NODE, "Using mock bus with a simulated node");
                (Arc::new(CanBus::with_adapter(mock, 1024)), Some(sim))
            }
            "socketcan" => {
                let bus_config = BusConfig {
                    transport: TransportConfig::SocketCan(SocketCanConfig {
                        interface: config.channel.clone(),
                        bitrate: config.bitrate,
                    }),
                    ..BusConfig::default()
                };
                let bus = CanBus::connect(&bus_config)
                    .await
                    .with_context(|| format!("Failed to open CAN channel {}", config.channel))?;
                (bus, None)
            }
            other => bail!("Unknown interface '{}', expected socketcan or mock", other),
        };

        Ok(Self {
            bus,
            store: Arc::new(store),
            node: config.node,
            _simulated: simulated,
        })
    }

    pub fn exchange(&self) -> NodeExchange {
        NodeExchange::new(
            self.bus.clone(),
            ExchangeConfig {
                node_id: self.node,
                ..ExchangeConfig::default()
            },
        )
    }

    /// Identification of a node, failing when it does not answer
    pub async fn identify(&self, node: u8) -> Result<NodeIdentity> {
        self.exchange()
            .get_node_information(node)
            .await?
            .ok_or_else(|| anyhow!("Node {} not found", node))
    }

    pub fn device_for(&self, id: &NodeIdentity) -> Option<Arc<DeviceDefinition>> {
        self.store
            .find(id.device_type, id.model, id.firmware_version)
    }

    /// Configuration records for a node, with the parent of `key` read
    /// from the node when `key` depends on one
    pub async fn config_set(
        &self,
        node: u8,
        device: &DeviceDefinition,
        key: u16,
    ) -> Result<ConfigSet> {
        let mut set = ConfigSet::for_device(device);
        let record = set
            .get(key)
            .ok_or_else(|| anyhow!("{} has no configuration key {}", device.name, key))?;
        if let Some(parent_key) = record.item().parent_key() {
            let parent = set
                .get(parent_key)
                .ok_or_else(|| anyhow!("Key {} depends on unknown key {}", key, parent_key))?;
            let datatype = parent
                .datatype()
                .ok_or_else(|| anyhow!("Key {} has no datatype", parent_key))?;
            let multiplier = parent.multiplier();
            if let Some(value) = self
                .exchange()
                .query_value(node, parent_key, datatype, multiplier)
                .await?
            {
                set.load_value(parent_key, value)?;
            }
        }
        Ok(set)
    }
}

fn mock_node_config() -> SimulatedNodeConfig {
    SimulatedNodeConfig {
        node_id: MOCK_NODE,
        identity: NodeIdentity {
            device_type: 0x30,
            firmware_version: 1,
            model: 1,
        },
        firmware_code: 0x5A5A,
        driver: FirmwareDriver::Streamed,
        configuration: BTreeMap::from([(16, vec![0x90, 0x01]), (17, vec![0x00])]),
        heartbeat: Some(Duration::from_millis(500)),
        parameters: vec![(0x183, vec![0xE8, 0x03])],
        ..SimulatedNodeConfig::default()
    }
}
