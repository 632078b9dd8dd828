//! CAN-FIX application protocol
//!
//! Identifier ranges and node-specific control codes, plus the codec that
//! turns frames into [`Message`]s.

mod error;
mod message;

pub use error::{CodecError, CodecResult};
pub use message::{
    channel_id, config_status_text, node_id, ConfigFrame, Function, Message, NodeIdentity,
    ParameterFrame,
};

/// Protocol revision reported in identification responses
pub const CANFIX_VERSION: u8 = 0x01;

/// Identifier ranges (11-bit)
pub mod id {
    /// Node alarms, identifier = node
    pub const ALARM_MAX: u16 = 0x0FF;
    pub const PARAMETER_MIN: u16 = 0x100;
    pub const PARAMETER_MAX: u16 = 0x6DF;
    /// Node-specific messages, identifier = base + sender
    pub const NODE_SPECIFIC_BASE: u16 = 0x6E0;
    pub const NODE_SPECIFIC_MAX: u16 = 0x7DF;
    /// Two-way channels, request = base + 2c, response = base + 2c + 1
    pub const CHANNEL_BASE: u16 = 0x7E0;
    pub const CHANNEL_MAX: u16 = 0x7FF;
    pub const CHANNEL_COUNT: u8 = 16;
}

/// Node-specific control codes
pub mod code {
    pub const NODE_IDENTIFICATION: u8 = 0x00;
    pub const BITRATE_SET: u8 = 0x01;
    pub const NODE_ID_SET: u8 = 0x02;
    pub const DISABLE_PARAMETER: u8 = 0x03;
    pub const ENABLE_PARAMETER: u8 = 0x04;
    pub const NODE_REPORT: u8 = 0x05;
    pub const NODE_STATUS: u8 = 0x06;
    pub const UPDATE_FIRMWARE: u8 = 0x07;
    pub const TWO_WAY_CONNECTION: u8 = 0x08;
    pub const CONFIG_SET: u8 = 0x09;
    pub const CONFIG_QUERY: u8 = 0x0A;
    pub const NODE_DESCRIPTION: u8 = 0x0B;
}
