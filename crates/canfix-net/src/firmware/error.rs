//! Firmware package and transfer errors

use std::fmt;

use thiserror::Error;

use crate::bus::BusError;
use crate::exchange::ExchangeError;
use crate::protocol::CodecError;

/// Errors loading a firmware package
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid index.json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("package has no index.json")]
    MissingIndex,

    #[error("file '{0}' listed in index.json is not in the package")]
    MissingFile(String),

    #[error("file entry '{name}' is missing '{field}'")]
    MissingField { name: String, field: &'static str },

    #[error("{0} not yet implemented")]
    NotImplemented(String),

    #[error("unknown file type {0}")]
    UnknownFormat(String),

    #[error("invalid hex data in '{name}': {reason}")]
    Hex { name: String, reason: String },

    #[error("invalid data in '{name}': {reason}")]
    InvalidData { name: String, reason: String },

    #[error("block size {size} of '{name}' is not a power of two")]
    BadBlockSize { name: String, size: u32 },

    #[error("'{name}' at offset 0x{offset:08X} with {size} bytes runs past the 32-bit address space")]
    AddressOverflow { name: String, offset: u32, size: usize },

    #[error("block size {size} of '{name}' is larger than the {limit} byte page buffer")]
    BlockTooLarge { name: String, size: u32, limit: u32 },
}

/// Error code reported by a node in reply to a block start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    BadBlockType,
    WrongSubsystem,
    UnsupportedBlockSize,
    BadAddress,
    Unknown(u8),
}

impl NodeErrorKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::BadBlockType,
            0x01 => Self::WrongSubsystem,
            0x02 => Self::UnsupportedBlockSize,
            0x03 => Self::BadAddress,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadBlockType => write!(f, "Bad Block Type Error"),
            Self::WrongSubsystem => write!(f, "Wrong Subsystem Error"),
            Self::UnsupportedBlockSize => write!(f, "Unsupported Block Size Error"),
            Self::BadAddress => write!(f, "Bad Address Error"),
            Self::Unknown(code) => write!(f, "Unknown Node Error 0x{:02X}", code),
        }
    }
}

/// Errors that end a firmware transfer
#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("timeout waiting for acknowledgement")]
    Timeout,

    #[error("bad block offset received: expected {expected}, got {received}")]
    BadOffset { expected: u32, received: u32 },

    #[error("{kind} (block type {block_type}, subsystem {subsystem}, offset 0x{offset:08X})")]
    Node {
        kind: NodeErrorKind,
        block_type: u8,
        subsystem: u8,
        offset: u32,
    },

    #[error("download stopped")]
    Cancelled,

    #[error("unknown firmware driver '{0}'")]
    UnknownDriver(String),

    #[error("device '{0}' has no firmware update code")]
    NoFirmwareCode(String),

    #[error("node {0} did not answer the firmware update request")]
    NoResponse(u8),

    #[error("node {node} refused the firmware update (status {status})")]
    Refused { node: u8, status: u8 },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl FirmwareError {
    /// Node-reported error, if this is one
    pub fn node_error(&self) -> Option<NodeErrorKind> {
        match self {
            Self::Node { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type PackageResult<T> = Result<T, PackageError>;
pub type FirmwareResult<T> = Result<T, FirmwareError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_node_error_text_carries_offset() {
        let err = FirmwareError::Node {
            kind: NodeErrorKind::from_code(3),
            block_type: 1,
            subsystem: 0,
            offset: 0x400,
        };
        let text = err.to_string();
        assert!(text.starts_with("Bad Address Error"));
        assert!(text.contains("0x00000400"));
        assert_eq!(err.node_error(), Some(NodeErrorKind::BadAddress));
    }

    #[rstest]
    #[case(0x00, NodeErrorKind::BadBlockType, "Bad Block Type Error")]
    #[case(0x01, NodeErrorKind::WrongSubsystem, "Wrong Subsystem Error")]
    #[case(0x02, NodeErrorKind::UnsupportedBlockSize, "Unsupported Block Size Error")]
    #[case(0x03, NodeErrorKind::BadAddress, "Bad Address Error")]
    fn test_node_error_codes(#[case] code: u8, #[case] kind: NodeErrorKind, #[case] text: &str) {
        assert_eq!(NodeErrorKind::from_code(code), kind);
        assert_eq!(kind.to_string(), text);
    }

    #[test]
    fn test_unknown_node_code() {
        assert_eq!(NodeErrorKind::from_code(0x42), NodeErrorKind::Unknown(0x42));
        assert_eq!(NodeErrorKind::Unknown(0x42).to_string(), "Unknown Node Error 0x42");
    }
}
