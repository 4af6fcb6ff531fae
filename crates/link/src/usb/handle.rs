//! rusb-backed device handle
//!
//! [`RusbDevice`] is the production [`DeviceIo`]. Bulk transfers share the
//! handle through a read lock; claiming and releasing take the write lock,
//! which the session only does while no worker is running.

use crate::usb::descriptor::{interfaces, select_bulk_pair};
use crate::usb::permission::DeviceOpener;
use common::{DeviceIo, Error, OpenHandle, ResolvedInterface, Result};
use protocol::{DeviceDescriptor, EndpointDescriptor};
use rusb::{Context, DeviceHandle, UsbContext};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Map a rusb transfer error onto the link taxonomy
pub fn map_rusb_error(err: rusb::Error, endpoint: u8) -> Error {
    match err {
        rusb::Error::Timeout => Error::TransferTimeout { endpoint },
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            Error::DeviceUnavailable(err.to_string())
        }
        _ => Error::TransferError {
            endpoint,
            reason: err.to_string(),
        },
    }
}

fn map_claim_error(err: rusb::Error, interface: u8, device: &DeviceDescriptor) -> Error {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            Error::DeviceUnavailable(err.to_string())
        }
        rusb::Error::Access => Error::PermissionDenied(device.id),
        _ => Error::ClaimFailed {
            interface,
            reason: err.to_string(),
        },
    }
}

struct HandleState {
    handle: DeviceHandle<Context>,
    /// Interfaces whose kernel driver we detached
    kernel_detached: Vec<u8>,
}

/// Open libusb device
pub struct RusbDevice {
    descriptor: DeviceDescriptor,
    preferred_interface: Option<u8>,
    state: RwLock<HandleState>,
}

impl RusbDevice {
    pub fn new(
        handle: DeviceHandle<Context>,
        descriptor: DeviceDescriptor,
        preferred_interface: Option<u8>,
    ) -> Self {
        Self {
            descriptor,
            preferred_interface,
            state: RwLock::new(HandleState {
                handle,
                kernel_detached: Vec::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HandleState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HandleState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceIo for RusbDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn resolve_interface(&self) -> Result<ResolvedInterface> {
        let device = self.read().handle.device();
        let found = interfaces(&device).map_err(|e| match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => {
                Error::DeviceUnavailable(e.to_string())
            }
            other => Error::ClaimFailed {
                interface: self.preferred_interface.unwrap_or(0),
                reason: format!("Failed to get config descriptor: {}", other),
            },
        })?;

        select_bulk_pair(&found, self.preferred_interface).ok_or_else(|| {
            Error::DeviceUnavailable(format!(
                "{} has no interface with a bulk IN/OUT pair",
                self.descriptor
            ))
        })
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.write();

        match state.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface, self.descriptor.id
                );
                match state.handle.detach_kernel_driver(interface) {
                    Ok(()) => state.kernel_detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        state
            .handle
            .claim_interface(interface)
            .map_err(|e| map_claim_error(e, interface, &self.descriptor))?;
        debug!("Claimed interface {} on {}", interface, self.descriptor.id);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.write();

        let released = state
            .handle
            .release_interface(interface)
            .map_err(|e| map_claim_error(e, interface, &self.descriptor));

        if let Some(pos) = state.kernel_detached.iter().position(|&i| i == interface) {
            state.kernel_detached.remove(pos);
            if let Err(e) = state.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        released?;
        debug!("Released interface {} on {}", interface, self.descriptor.id);
        Ok(())
    }

    fn read_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.read()
            .handle
            .read_bulk(endpoint.address, buf, timeout)
            .map_err(|e| map_rusb_error(e, endpoint.address))
    }

    fn write_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.read()
            .handle
            .write_bulk(endpoint.address, data, timeout)
            .map_err(|e| map_rusb_error(e, endpoint.address))
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        debug!("Closed device {}", self.descriptor.id);
    }
}

/// Opens devices on the host bus by bus number and address
#[derive(Clone)]
pub struct RusbOpener {
    context: Context,
    preferred_interface: Option<u8>,
}

impl RusbOpener {
    pub fn new(context: Context, preferred_interface: Option<u8>) -> Self {
        Self {
            context,
            preferred_interface,
        }
    }
}

impl DeviceOpener for RusbOpener {
    fn open(&self, device: &DeviceDescriptor) -> Result<OpenHandle> {
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        let found = devices
            .iter()
            .find(|d| d.bus_number() == device.id.bus && d.address() == device.id.address)
            .ok_or_else(|| Error::DeviceUnavailable(format!("{} is no longer present", device)))?;

        let handle = found.open().map_err(|e| {
            warn!("Failed to open device {}: {}", device.id, e);
            match e {
                rusb::Error::Access => Error::PermissionDenied(device.id),
                other => Error::DeviceUnavailable(other.to_string()),
            }
        })?;

        debug!("Opened device {}", device.id);
        Ok(Arc::new(RusbDevice::new(
            handle,
            device.clone(),
            self.preferred_interface,
        )))
    }
}
