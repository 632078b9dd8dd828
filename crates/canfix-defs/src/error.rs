//! Error types for CAN-FIX definitions and value conversion

use thiserror::Error;

use crate::types::DataType;

/// Errors raised while loading definitions or converting values
#[derive(Debug, Error)]
pub enum DefsError {
    /// Unknown datatype name
    #[error("unknown datatype: {0}")]
    UnknownDataType(String),

    /// Integer field could not be parsed
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// Data too short for the expected type
    #[error("data too short for {datatype}: expected {expected} bytes, got {actual}")]
    DataTooShort {
        datatype: DataType,
        expected: usize,
        actual: usize,
    },

    /// Value cannot be represented in the datatype
    #[error("value {value} does not fit in {datatype}")]
    ValueOutOfRange { value: f64, datatype: DataType },

    /// Value has the wrong shape for the datatype
    #[error("{datatype} cannot hold {found}")]
    TypeMismatch { datatype: DataType, found: String },

    /// Definition is missing a required field
    #[error("missing required field '{0}'")]
    MissingField(String),

    /// Definition file is malformed
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// YAML parsing error
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for definition operations
pub type DefsResult<T> = Result<T, DefsError>;

/// Parse an integer the way definition files write them
///
/// Accepts decimal ("16"), hex ("0x10", "0X10"), octal ("0o20") and
/// binary ("0b10000") with surrounding whitespace.
pub fn parse_int(s: &str) -> DefsResult<i64> {
    let t = s.trim();
    let (negative, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let lower = t.to_ascii_lowercase();
    let parsed = if let Some(h) = lower.strip_prefix("0x") {
        i64::from_str_radix(h, 16)
    } else if let Some(o) = lower.strip_prefix("0o") {
        i64::from_str_radix(o, 8)
    } else if let Some(b) = lower.strip_prefix("0b") {
        i64::from_str_radix(b, 2)
    } else {
        lower.parse::<i64>()
    };
    parsed
        .map(|v| if negative { -v } else { v })
        .map_err(|_| DefsError::InvalidNumber(s.to_string()))
}

/// Read an integer from a JSON value that may be a number or a string
pub fn int_from_json(value: &serde_json::Value) -> DefsResult<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| DefsError::InvalidNumber(n.to_string())),
        serde_json::Value::String(s) => parse_int(s),
        other => Err(DefsError::InvalidNumber(other.to_string())),
    }
}
