//! Error types shared across the controller.

use crate::domain::models::{ConnectionState, PeripheralId};
use thiserror::Error;
use uuid::Uuid;

/// Failures while framing or parsing a command packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("packet truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#04X}, found {found:#04X}")]
    ChecksumMismatch { expected: u8, found: u8 },

    #[error("payload of {0} bytes exceeds the 255 byte limit")]
    PayloadTooLarge(usize),

    #[error("invalid start-of-packet marker {0:#04X}")]
    BadStartOfPacket(u8),
}

/// Failures reported by the host Bluetooth stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("device not ready for this request (state: {state})")]
    ProtocolNotReady { state: ConnectionState },

    #[error("callback for a peripheral or service that is no longer tracked")]
    DiscoveryStale,

    #[error("write to {characteristic} failed: {reason}")]
    WriteFailed { characteristic: Uuid, reason: String },

    #[error("connection to {0} lost")]
    ConnectionLost(PeripheralId),

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("no active peripheral")]
    NoActivePeripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum InputError {
    #[error("control disc radius must be positive and finite, got {0}")]
    InvalidRadius(f64),
}
