//! Link error taxonomy

use crate::state::SessionState;
use protocol::{DeviceId, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No matching device, or the device went away
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// User or OS refused consent
    #[error("Permission denied for device {0}")]
    PermissionDenied(DeviceId),

    /// A consent request for this device is still unresolved
    #[error("Permission request already pending for device {0}")]
    AlreadyPending(DeviceId),

    /// Interface busy or unsupported
    #[error("Failed to claim interface {interface}: {reason}")]
    ClaimFailed { interface: u8, reason: String },

    #[error("Transfer timed out on endpoint {endpoint:#04x}")]
    TransferTimeout { endpoint: u8 },

    /// I/O failure or short transfer
    #[error("Transfer error on endpoint {endpoint:#04x}: {reason}")]
    TransferError { endpoint: u8, reason: String },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Chunk stream lost sync; recovered locally, only reported as a signal
    #[error("Chunk stream resynchronized after skipping {skipped} bytes")]
    DecodeResync { skipped: u64 },

    /// Operation invalid for the current session state
    #[error("Cannot {operation} while {state}")]
    StateViolation {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that end the current session and are reported once to the caller
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_)
                | Self::PermissionDenied(_)
                | Self::ClaimFailed { .. }
                | Self::TransferTimeout { .. }
                | Self::TransferError { .. }
        )
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::FrameTooLarge { size, max } => Self::FrameTooLarge { size, max },
            other => Self::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
