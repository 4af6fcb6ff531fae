//! USB subsystem
//!
//! Device discovery, permission negotiation and the libusb-backed handle the
//! transport session streams over. Hot-plug events are serviced on a
//! dedicated thread; transfers run on the streaming workers.

pub mod descriptor;
pub mod discovery;
pub mod filter;
pub mod handle;
pub mod permission;

pub use discovery::{DeviceDiscovery, DeviceRegistry, list_devices};
pub use filter::{DeviceFilter, FilterParseError};
pub use handle::{RusbDevice, RusbOpener};
pub use permission::{
    ChannelConsent, ConfigConsent, Consent, ConsentProvider, ConsentReply, ConsentRequest,
    DeviceOpener, PendingPermission, PermissionNegotiator, PermissionOutcome,
};
