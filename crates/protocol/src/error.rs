//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame length exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Packet size cannot carry a header plus at least one payload byte
    #[error("Packet size {packet} too small: need at least {min} bytes")]
    PacketTooSmall { packet: usize, min: usize },

    /// Buffer too small to hold a chunk header
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Header present but its fields are not plausible
    #[error("Invalid chunk header: {reason}")]
    InvalidHeader { reason: String },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
