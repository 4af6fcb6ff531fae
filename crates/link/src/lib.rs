//! USB bulk frame link
//!
//! Streams variable-length frames between two peers over a USB bulk
//! interface. One peer runs the sender role and pushes frames out of the
//! bulk OUT endpoint; the other runs the receiver role and reassembles them
//! from the bulk IN endpoint for a sink.
//!
//! The pieces, leaves first:
//! - [`usb::DeviceDiscovery`] forwards attach and detach events
//! - [`usb::PermissionNegotiator`] resolves consent to open a device
//! - [`TransportSession`] owns the open device and its state machine
//! - [`FrameSender`] and [`FrameReceiver`] drive transfers while streaming

pub mod config;
pub mod files;
pub mod session;
pub mod stream;
pub mod usb;

pub use session::{Selection, StreamRole, TransportSession};
pub use stream::{
    FrameReceiver, FrameSender, FrameSink, StreamStats, StreamStatsSnapshot, TransferSettings,
};
