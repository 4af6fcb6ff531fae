//! Common utilities for usb-frame-link
//!
//! This crate provides the pieces shared by the transport session and its
//! streaming roles: the link error taxonomy, logging setup, the event channels
//! that carry hot-plug and session notifications, and the `DeviceIo` seam an
//! open USB handle is accessed through.

pub mod channel;
pub mod error;
pub mod io;
pub mod logging;
pub mod state;
pub mod test_utils;

pub use channel::{DiscoveryEvent, EventReceiver, EventSender, SessionEvent, event_channel};
pub use error::{Error, Result};
pub use io::{DeviceIo, OpenHandle, ResolvedInterface};
pub use logging::setup_logging;
pub use state::{Role, SessionId, SessionState};
