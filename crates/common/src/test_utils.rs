//! Test utilities for usb-frame-link
//!
//! Provides a scripted [`DeviceIo`] implementation and helper functions for
//! testing the session and streaming roles without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockDeviceIo, create_mock_descriptor};
//!
//! let (device, probe) = MockDeviceIo::new(create_mock_descriptor(4, 0x1234, 0x5678));
//! drop(device);
//! assert!(probe.is_closed());
//! ```

use crate::{DeviceIo, Error, ResolvedInterface, Result};
use protocol::{DeviceDescriptor, DeviceId, EndpointDescriptor};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN endpoint address used by the mock
pub const MOCK_IN_ENDPOINT: u8 = 0x81;

/// Bulk OUT endpoint address used by the mock
pub const MOCK_OUT_ENDPOINT: u8 = 0x01;

/// Create a mock DeviceDescriptor on bus 1
///
/// # Example
/// ```
/// use common::test_utils::create_mock_descriptor;
///
/// let device = create_mock_descriptor(3, 0x18d1, 0x4ee7);
/// assert_eq!(device.id.address, 3);
/// assert_eq!(device.vendor_id, 0x18d1);
/// ```
pub fn create_mock_descriptor(address: u8, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        id: DeviceId::new(1, address),
        vendor_id,
        product_id,
        port_path: vec![address],
        name: format!("Test Device {}", address),
    }
}

/// Create a list of mock descriptors at addresses 1..=count
pub fn create_mock_descriptor_list(count: u8) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_descriptor(i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Poll `condition` until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Scripted outcome of one bulk read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    ZeroLength,
    Failure,
}

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<MockRead>,
    writes: Vec<Vec<u8>>,
    claimed: Option<u8>,
    released: Vec<u8>,
    gate_closed: bool,
    detached: bool,
    claim_busy: bool,
    short_write_at: Option<usize>,
}

#[derive(Debug)]
struct MockShared {
    state: Mutex<MockState>,
    changed: Condvar,
    closed: AtomicBool,
}

impl MockShared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scripted device handle
///
/// Reads are served from a queue filled through the paired [`MockProbe`];
/// an empty queue waits for the transfer timeout and reports a timeout.
/// Writes are recorded and can be held back with a gate. Dropping the
/// device marks it closed.
#[derive(Debug)]
pub struct MockDeviceIo {
    descriptor: DeviceDescriptor,
    interface: ResolvedInterface,
    shared: Arc<MockShared>,
}

impl MockDeviceIo {
    /// Create a device with 512-byte bulk endpoints on interface 0
    pub fn new(descriptor: DeviceDescriptor) -> (Self, MockProbe) {
        Self::with_max_packet(descriptor, 512)
    }

    /// Create a device with the given bulk max packet size
    pub fn with_max_packet(descriptor: DeviceDescriptor, max_packet: u16) -> (Self, MockProbe) {
        let shared = Arc::new(MockShared {
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let device = Self {
            descriptor,
            interface: ResolvedInterface {
                number: 0,
                input: EndpointDescriptor::bulk(MOCK_IN_ENDPOINT, max_packet),
                output: EndpointDescriptor::bulk(MOCK_OUT_ENDPOINT, max_packet),
            },
            shared: Arc::clone(&shared),
        };
        (device, MockProbe { shared })
    }

    fn detached_error() -> Error {
        Error::DeviceUnavailable("device detached".to_string())
    }
}

impl DeviceIo for MockDeviceIo {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn resolve_interface(&self) -> Result<ResolvedInterface> {
        if self.shared.lock().detached {
            return Err(Self::detached_error());
        }
        Ok(self.interface)
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.shared.lock();
        if state.claim_busy {
            return Err(Error::ClaimFailed {
                interface,
                reason: "Resource busy".to_string(),
            });
        }
        state.claimed = Some(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.shared.lock();
        state.claimed = None;
        state.released.push(interface);
        Ok(())
    }

    fn read_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if state.detached {
                return Err(Self::detached_error());
            }

            match state.reads.pop_front() {
                Some(MockRead::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(n);
                }
                Some(MockRead::ZeroLength) => return Ok(0),
                Some(MockRead::Failure) => {
                    return Err(Error::TransferError {
                        endpoint: endpoint.address,
                        reason: "Input/Output Error".to_string(),
                    });
                }
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TransferTimeout {
                    endpoint: endpoint.address,
                });
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    fn write_bulk(
        &self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if state.detached {
                return Err(Self::detached_error());
            }
            if !state.gate_closed {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TransferTimeout {
                    endpoint: endpoint.address,
                });
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }

        if state.short_write_at == Some(state.writes.len()) {
            state.short_write_at = None;
            return Ok(data.len() / 2);
        }

        state.writes.push(data.to_vec());
        self.shared.changed.notify_all();
        Ok(data.len())
    }
}

impl Drop for MockDeviceIo {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
    }
}

/// Test-side control over a [`MockDeviceIo`]
#[derive(Debug, Clone)]
pub struct MockProbe {
    shared: Arc<MockShared>,
}

impl MockProbe {
    fn update(&self, f: impl FnOnce(&mut MockState)) {
        {
            let mut state = self.shared.lock();
            f(&mut *state);
        }
        self.shared.changed.notify_all();
    }

    /// Queue bytes for the next bulk read
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        self.update(|s| s.reads.push_back(MockRead::Data(data)));
    }

    /// Queue a zero-length read
    pub fn push_zero_length(&self) {
        self.update(|s| s.reads.push_back(MockRead::ZeroLength));
    }

    /// Queue a failing read
    pub fn push_read_failure(&self) {
        self.update(|s| s.reads.push_back(MockRead::Failure));
    }

    /// Hold writes back until the gate is opened again
    pub fn close_gate(&self) {
        self.update(|s| s.gate_closed = true);
    }

    pub fn open_gate(&self) {
        self.update(|s| s.gate_closed = false);
    }

    /// Make claiming the interface fail as busy
    pub fn set_claim_busy(&self, busy: bool) {
        self.update(|s| s.claim_busy = busy);
    }

    /// Accept only half of the bytes of the write after `successful` full writes
    pub fn short_write_after(&self, successful: usize) {
        self.update(|s| s.short_write_at = Some(successful));
    }

    /// Simulate unplugging: pending and future transfers fail
    pub fn detach(&self) {
        self.update(|s| s.detached = true);
    }

    /// Every buffer written so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().writes.clone()
    }

    /// Wait until at least `count` writes were recorded
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.writes.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }

    pub fn claimed(&self) -> Option<u8> {
        self.shared.lock().claimed
    }

    pub fn released(&self) -> Vec<u8> {
        self.shared.lock().released.clone()
    }

    /// Whether the device handle has been dropped
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
