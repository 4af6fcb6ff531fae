//! Device discovery
//!
//! Translates host bus hot-plug notifications into [`DiscoveryEvent`]s. The
//! libusb callback runs on the discovery thread while it services events, so
//! it only updates the registry and emits without blocking. Hosts without
//! hot-plug support fall back to rescanning the bus once per second.

use crate::usb::descriptor::{describe, is_root_hub};
use crate::usb::filter::DeviceFilter;
use common::{DiscoveryEvent, Error, EventSender, Result};
use protocol::{DeviceDescriptor, DeviceId};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EVENT_TIMEOUT: Duration = Duration::from_millis(100);
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Devices currently present on the bus that pass the filters
///
/// Every attach and detach goes through here, so overlapping sources
/// (startup enumeration, hot-plug, rescans) yield each event once.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    filters: Vec<DeviceFilter>,
    present: BTreeMap<DeviceId, DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new(filters: Vec<DeviceFilter>) -> Self {
        Self {
            filters,
            present: BTreeMap::new(),
        }
    }

    /// Record a device, returning the event to emit if it is new and allowed
    pub fn attach(&mut self, device: DeviceDescriptor) -> Option<DiscoveryEvent> {
        if !DeviceFilter::any_matches(&self.filters, device.vendor_id, device.product_id) {
            debug!("Device ignored by filter: {}", device);
            return None;
        }
        if self.present.contains_key(&device.id) {
            return None;
        }

        debug!("Added device {}", device);
        self.present.insert(device.id, device.clone());
        Some(DiscoveryEvent::Attached(device))
    }

    /// Forget a device, returning the event to emit if it was known
    pub fn detach(&mut self, id: DeviceId) -> Option<DiscoveryEvent> {
        self.present.remove(&id).map(|device| {
            debug!("Removed device {}", device);
            DiscoveryEvent::Detached(id)
        })
    }

    /// Reconcile against a full bus listing
    pub fn reconcile(&mut self, listing: Vec<DeviceDescriptor>) -> Vec<DiscoveryEvent> {
        let seen: HashSet<DeviceId> = listing.iter().map(|d| d.id).collect();
        let gone: Vec<DeviceId> = self
            .present
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();

        let mut events: Vec<DiscoveryEvent> =
            gone.into_iter().filter_map(|id| self.detach(id)).collect();
        events.extend(listing.into_iter().filter_map(|d| self.attach(d)));
        events
    }

    /// Present devices ordered by bus and address
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.present.values().cloned().collect()
    }
}

type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, DeviceRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Enumerate the bus, skipping root hubs
fn scan<T: UsbContext>(context: &T) -> rusb::Result<Vec<DeviceDescriptor>> {
    let devices = context.devices()?;
    Ok(devices
        .iter()
        .filter(|device| !is_root_hub(device))
        .filter_map(|device| match describe(&device, true) {
            Ok(desc) => Some(desc),
            Err(e) => {
                debug!(
                    "Skipping device bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                None
            }
        })
        .collect())
}

/// Hot-plug callback handler
struct HotplugForwarder {
    registry: SharedRegistry,
    events: EventSender<DiscoveryEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        if is_root_hub(&device) {
            return;
        }
        match describe(&device, false) {
            Ok(desc) => {
                if let Some(event) = lock(&self.registry).attach(desc) {
                    self.events.emit(event);
                }
            }
            Err(e) => warn!(
                "Failed to describe arrived device bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let id = DeviceId::new(device.bus_number(), device.address());
        if let Some(event) = lock(&self.registry).detach(id) {
            self.events.emit(event);
        }
    }
}

/// Watches the host bus for matching devices
pub struct DeviceDiscovery {
    registry: SharedRegistry,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    registration: Option<Registration<Context>>,
}

impl DeviceDiscovery {
    /// Start watching; attach and detach events are sent on `events`
    ///
    /// Devices already present are not announced; use
    /// [`list_current_devices`](Self::list_current_devices) to reconcile.
    pub fn start(
        context: Context,
        filters: Vec<DeviceFilter>,
        events: EventSender<DiscoveryEvent>,
    ) -> Result<Self> {
        let registry: SharedRegistry = Arc::new(Mutex::new(DeviceRegistry::new(filters)));

        let registration = if rusb::has_hotplug() {
            let callback = HotplugForwarder {
                registry: Arc::clone(&registry),
                events: events.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(callback))
                .map_err(|e| Error::DeviceUnavailable(format!("hot-plug registration: {}", e)))?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("Host has no hot-plug support, rescanning every {:?}", RESCAN_INTERVAL);
            None
        };

        let listing =
            scan(&context).map_err(|e| Error::DeviceUnavailable(format!("enumeration: {}", e)))?;
        // Present before we started watching: recorded silently
        let _ = lock(&registry).reconcile(listing);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = std::thread::Builder::new()
            .name("usb-discovery".to_string())
            .spawn({
                let context = context.clone();
                let registry = Arc::clone(&registry);
                let stop = Arc::clone(&stop);
                let polling = registration.is_none();
                move || run_discovery(context, registry, events, stop, polling)
            })?;

        info!(
            "Device discovery started with {} devices",
            lock(&registry).devices().len()
        );

        Ok(Self {
            registry,
            stop,
            worker: Some(worker),
            registration,
        })
    }

    /// Matching devices present right now
    pub fn list_current_devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.registry).devices()
    }

    /// Stop the discovery thread; events already emitted stay queued
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("Discovery thread panicked");
        }
        self.registration.take();
    }
}

impl Drop for DeviceDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_discovery(
    context: Context,
    registry: SharedRegistry,
    events: EventSender<DiscoveryEvent>,
    stop: Arc<AtomicBool>,
    polling: bool,
) {
    debug!("Discovery thread started");
    let mut last_scan = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if polling {
            std::thread::sleep(EVENT_TIMEOUT);
            if last_scan.elapsed() < RESCAN_INTERVAL {
                continue;
            }
            last_scan = Instant::now();
            match scan(&context) {
                Ok(listing) => {
                    for event in lock(&registry).reconcile(listing) {
                        events.emit(event);
                    }
                }
                Err(e) => warn!("Failed to rescan bus: {}", e),
            }
            continue;
        }

        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    debug!("Discovery thread stopped");
}

/// One-off listing for `--list-devices`
pub fn list_devices(context: &Context, filters: &[DeviceFilter]) -> Result<Vec<DeviceDescriptor>> {
    let mut registry = DeviceRegistry::new(filters.to_vec());
    let listing =
        scan(context).map_err(|e| Error::DeviceUnavailable(format!("enumeration: {}", e)))?;
    registry.reconcile(listing);
    Ok(registry.devices())
}
