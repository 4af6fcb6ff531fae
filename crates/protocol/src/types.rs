//! Device and endpoint type definitions
//!
//! Data model shared by discovery, the permission negotiator and the transport
//! session. All values here are plain data and immutable once produced.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a device on the host bus
///
/// The bus number and device address are assigned by the host when the device
/// enumerates and stay fixed until it is unplugged, so they identify one
/// physical attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Bus number on the host
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl DeviceId {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Device information produced by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Bus position of this attachment
    pub id: DeviceId,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Hub port chain from the root port (empty if unknown)
    pub port_path: Vec<u8>,
    /// Product string, or "VID:PID" when the string descriptor is unreadable
    pub name: String,
}

impl DeviceDescriptor {
    /// Human-readable bus path such as `1-3.2`
    pub fn bus_path(&self) -> String {
        if self.port_path.is_empty() {
            return self.id.bus.to_string();
        }
        let ports: Vec<String> = self.port_path.iter().map(u8::to_string).collect();
        format!("{}-{}", self.id.bus, ports.join("."))
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} ({})",
            self.vendor_id,
            self.product_id,
            self.name,
            self.bus_path()
        )
    }
}

/// Endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint transfer kind
///
/// Only bulk endpoints carry frames, the other kinds exist so that endpoint
/// resolution can skip them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One unidirectional channel of a claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address, including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Maximum packet size in bytes
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// Describe a bulk endpoint, deriving the direction from bit 7 of the address
    pub fn bulk(address: u8, max_packet_size: u16) -> Self {
        let direction = if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        Self {
            address,
            direction,
            kind: TransferKind::Bulk,
            max_packet_size,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.kind == TransferKind::Bulk
    }
}
