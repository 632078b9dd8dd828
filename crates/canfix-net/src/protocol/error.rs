//! Codec errors

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Clone)]
pub enum CodecError {
    #[error("{kind} needs at least {expected} data bytes, got {actual}")]
    TooShort {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("identifier 0x{0:03X} is outside the CAN-FIX map")]
    UnknownId(u16),

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error(transparent)]
    Frame(#[from] TransportError),
}

pub type CodecResult<T> = Result<T, CodecError>;
