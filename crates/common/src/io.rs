//! Access to an open USB device
//!
//! The transport session and its roles only see a device through [`DeviceIo`].
//! The production implementation wraps a libusb handle; tests substitute a
//! scripted mock. Dropping the last [`OpenHandle`] closes the device.

use crate::Result;
use protocol::{DeviceDescriptor, EndpointDescriptor};
use std::sync::Arc;
use std::time::Duration;

/// Interface chosen for streaming together with its bulk endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInterface {
    /// Interface number to claim
    pub number: u8,
    /// Bulk IN endpoint (device to host)
    pub input: EndpointDescriptor,
    /// Bulk OUT endpoint (host to device)
    pub output: EndpointDescriptor,
}

/// Blocking I/O against one open device
///
/// Every transfer takes an explicit timeout and must return once it expires,
/// and must fail promptly rather than hang once the device is unplugged.
pub trait DeviceIo: Send + Sync {
    /// Device this handle was opened for
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Pick the interface exposing one bulk IN and one bulk OUT endpoint
    fn resolve_interface(&self) -> Result<ResolvedInterface>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Read up to `buf.len()` bytes from a bulk IN endpoint
    fn read_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Write `data` to a bulk OUT endpoint, returning the bytes accepted
    fn write_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;
}

/// Shared open device handle
pub type OpenHandle = Arc<dyn DeviceIo>;
