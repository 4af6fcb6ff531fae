//! Session states and roles

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing identifier of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state machine
///
/// ```text
/// Idle -> AwaitingPermission -> Connected -> Streaming -> Closing -> Idle
/// ```
///
/// `Error` is a pass-through state entered from any non-idle state when a
/// terminal error occurs, before the session unwinds back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No device bound
    Idle,
    /// Device selected, consent request outstanding
    AwaitingPermission,
    /// Handle open, interface claimed, endpoints resolved
    Connected,
    /// One role is driving transfers
    Streaming,
    /// Releasing the interface and handle
    Closing,
    /// Terminal error observed
    Error,
}

impl SessionState {
    /// Whether a device handle is held in this state
    pub fn holds_handle(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming | Self::Closing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::AwaitingPermission => "AwaitingPermission",
            Self::Connected => "Connected",
            Self::Streaming => "Streaming",
            Self::Closing => "Closing",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Streaming role, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Emitter: pushes frames out over the OUT endpoint
    Sender,
    /// Pulls chunks from the IN endpoint and reassembles frames
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}
