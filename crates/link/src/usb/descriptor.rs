//! Device and endpoint descriptor translation
//!
//! Turns libusb descriptors into the plain data types shared with the rest of
//! the link, and picks the interface used for streaming.

use common::ResolvedInterface;
use protocol::{DeviceDescriptor, DeviceId, Direction, EndpointDescriptor, TransferKind};
use rusb::{Device, UsbContext};
use std::time::Duration;
use tracing::debug;

const STRING_TIMEOUT: Duration = Duration::from_millis(200);

/// Interface as seen during endpoint resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEndpoints {
    pub number: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Build a [`DeviceDescriptor`] for a device on the bus
///
/// With `read_strings` the product string is read when the device can be
/// opened; otherwise the name falls back to `VID:PID`. Hot-plug callbacks
/// must not issue transfers, so they pass `false`.
pub fn describe<T: UsbContext>(
    device: &Device<T>,
    read_strings: bool,
) -> rusb::Result<DeviceDescriptor> {
    let desc = device.device_descriptor()?;
    let id = DeviceId::new(device.bus_number(), device.address());

    let name = read_strings
        .then(|| device.open().ok())
        .flatten()
        .and_then(|handle| {
            let language = handle.read_languages(STRING_TIMEOUT).ok()?.into_iter().next()?;
            handle
                .read_product_string(language, &desc, STRING_TIMEOUT)
                .ok()
        })
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("{:04x}:{:04x}", desc.vendor_id(), desc.product_id()));

    Ok(DeviceDescriptor {
        id,
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        port_path: device.port_numbers().unwrap_or_default(),
        name,
    })
}

/// Root hubs never carry a streaming interface
pub fn is_root_hub<T: UsbContext>(device: &Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == 0x1d6b && desc.class_code() == 9)
        .unwrap_or(false)
}

/// Collect the endpoints of every interface in the active configuration
pub fn interfaces<T: UsbContext>(device: &Device<T>) -> rusb::Result<Vec<InterfaceEndpoints>> {
    let config = device.active_config_descriptor()?;

    let interfaces = config
        .interfaces()
        .filter_map(|interface| {
            // Alternate setting 0 is active after claim
            let setting = interface.descriptors().next()?;
            let endpoints = setting
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    direction: match ep.direction() {
                        rusb::Direction::In => Direction::In,
                        rusb::Direction::Out => Direction::Out,
                    },
                    kind: match ep.transfer_type() {
                        rusb::TransferType::Control => TransferKind::Control,
                        rusb::TransferType::Isochronous => TransferKind::Isochronous,
                        rusb::TransferType::Bulk => TransferKind::Bulk,
                        rusb::TransferType::Interrupt => TransferKind::Interrupt,
                    },
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            Some(InterfaceEndpoints {
                number: interface.number(),
                endpoints,
            })
        })
        .collect();

    Ok(interfaces)
}

/// Pick the interface carrying one bulk IN and one bulk OUT endpoint
///
/// With `preferred` set only that interface number is considered; otherwise
/// the first qualifying interface wins.
pub fn select_bulk_pair(
    interfaces: &[InterfaceEndpoints],
    preferred: Option<u8>,
) -> Option<ResolvedInterface> {
    interfaces
        .iter()
        .filter(|interface| preferred.is_none_or(|n| n == interface.number))
        .find_map(|interface| {
            let bulk = |direction| {
                interface
                    .endpoints
                    .iter()
                    .find(|ep| ep.is_bulk() && ep.direction == direction)
                    .copied()
            };
            let resolved = ResolvedInterface {
                number: interface.number,
                input: bulk(Direction::In)?,
                output: bulk(Direction::Out)?,
            };
            debug!(
                "Selected interface {} (IN {:#04x}, OUT {:#04x})",
                resolved.number, resolved.input.address, resolved.output.address
            );
            Some(resolved)
        })
}
