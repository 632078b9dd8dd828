//! Bus adapter trait and frame type

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::TransportError;

/// Highest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// One classic CAN frame with a standard identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Build a frame, rejecting extended ids and payloads over 8 bytes
    pub fn new(id: u16, data: impl Into<Vec<u8>>) -> Result<Self, TransportError> {
        let data = data.into();
        if id > MAX_STANDARD_ID {
            return Err(TransportError::InvalidFrame(format!(
                "identifier 0x{:X} is not a standard id",
                id
            )));
        }
        if data.len() > 8 {
            return Err(TransportError::InvalidFrame(format!(
                "{} data bytes, at most 8 allowed",
                data.len()
            )));
        }
        Ok(Self { id, data })
    }

    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [{}]", self.id, self.dlc())?;
        for b in &self.data {
            write!(f, " {:02X}", b)?;
        }
        Ok(())
    }
}

/// Transport-agnostic interface to one physical CAN bus
///
/// Frames received from the network are published on a broadcast channel;
/// every subscriber sees every frame in arrival order.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Transmit one frame
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Subscribe to frames received from the network
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Check if the adapter is connected
    fn is_connected(&self) -> bool;

    /// Attempt to reconnect if disconnected
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Short description for logs ("socketcan:can0", "mock")
    fn name(&self) -> String;
}
