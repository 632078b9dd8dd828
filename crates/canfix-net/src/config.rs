//! Bus and service configuration
//!
//! Every type deserialises from an empty table, so configuration files only
//! need to mention what they change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN interface (Linux only)
    SocketCan(SocketCanConfig),
    /// In-memory bus for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Bus bitrate in kbit/s, informational; the interface is configured by the OS
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    125
}

/// Mock bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Delay applied to every send
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// Physical bus plus fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    /// Frames buffered per logical connection before the oldest are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_queue_depth() -> usize {
    1024
}

// =============================================================================
// Service Configuration
// =============================================================================

/// Node tracker timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Node id used as sender of identification requests
    #[serde(default = "default_node_id")]
    pub node_id: u8,
    /// Bounded receive per loop iteration
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Nodes and parameters unseen for longer than this are evicted
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

fn default_node_id() -> u8 {
    0xFF
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    2000
}

fn default_stale_after_ms() -> u64 {
    5000
}

/// Request/response exchange settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Node id used as sender of requests
    #[serde(default = "default_node_id")]
    pub node_id: u8,
    /// Window for a matching response, measured from the request
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl ExchangeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_response_timeout_ms() -> u64 {
    1000
}

/// Firmware transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Per-acknowledgement timeout
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Two-way channel used for the transfer
    #[serde(default)]
    pub channel: u8,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            channel: 0,
        }
    }
}

impl FirmwareConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

fn default_ack_timeout_ms() -> u64 {
    1000
}
