//! canfix-net - CAN-FIX network access
//!
//! This crate talks to a CAN-FIX network:
//!
//! - **Transport** - [`BusAdapter`] implementations for SocketCAN (Linux) and
//!   an in-memory mock
//! - **Bus** - one dispatcher fanning received frames out to independent
//!   logical [`Connection`]s, with serialized sends
//! - **Protocol** - decoding frames into [`Message`]s and back
//! - **Tracker** - a background loop keeping the set of live nodes and
//!   parameters, announced as [`TrackerEvent`]s
//! - **Exchange** - node identification and configuration query/set
//! - **Configuration files** - saving and restoring a node's configuration
//! - **Firmware** - package loading and the block transfer drivers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use canfix_defs::DeviceStore;
//! use canfix_net::{BusConfig, CanBus, TrackerConfig, TrackerService};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = CanBus::connect(&BusConfig::default()).await?;
//! let store = Arc::new(DeviceStore::from_dir("devices")?);
//! let tracker = TrackerService::spawn(&bus, store, &TrackerConfig::default());
//!
//! tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//! for node in tracker.nodes() {
//!     println!("{:3} {}", node.node_id, node.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod config_file;
pub mod exchange;
pub mod firmware;
pub mod protocol;
pub mod testing;
pub mod tracker;
pub mod transport;

pub use bus::{BusError, BusResult, BusStats, CanBus, Connection};
pub use config::{
    BusConfig, ExchangeConfig, FirmwareConfig, MockConfig, SocketCanConfig, TrackerConfig,
    TransportConfig,
};
pub use config_file::{
    ConfigFileError, ConfigFileResult, ConfigTransfer, LoadSummary, SavedConfiguration, SavedItem,
    TransferNotice,
};
pub use exchange::{ConfigResponse, ExchangeError, ExchangeResult, NodeExchange};
pub use firmware::{
    CancelHandle, FirmwareDriver, FirmwareError, FirmwarePackage, FirmwareResult,
    FirmwareUpdater, PackageError, TransferEvent, TransferOutcome, TransferState,
    TransferSummary,
};
pub use protocol::{CodecError, Message, NodeIdentity};
pub use tracker::{Node, NodeTracker, Parameter, TrackerError, TrackerEvent, TrackerService};
pub use transport::{create_adapter, BusAdapter, CanFrame, MockBusAdapter, TransportError};
