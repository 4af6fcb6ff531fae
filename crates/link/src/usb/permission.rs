//! Permission negotiation
//!
//! Opening a device needs consent from the user or the OS. The negotiator
//! forwards each request to a [`ConsentProvider`] and resolves it later
//! through a one-shot channel, so consent may take as long as a dialog stays
//! on screen. Only one request per device can be outstanding; it stays
//! outstanding until the provider answers or drops its [`ConsentReply`].

use crate::usb::filter::DeviceFilter;
use common::{Error, EventSender, OpenHandle, Result};
use protocol::{DeviceDescriptor, DeviceId};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Answer from the consent mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Denied,
}

/// Result of a resolved permission request
pub enum PermissionOutcome {
    /// Consent given and the device opened
    Granted(OpenHandle),
    Denied,
}

impl fmt::Debug for PermissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted(handle) => write!(f, "Granted({})", handle.descriptor().id),
            Self::Denied => f.write_str("Denied"),
        }
    }
}

/// Opens a device once consent is granted
pub trait DeviceOpener: Send + Sync {
    fn open(&self, device: &DeviceDescriptor) -> Result<OpenHandle>;
}

/// External consent mechanism (dialog, policy file, ...)
///
/// Implementations must not block; answer through `reply` now or later.
pub trait ConsentProvider: Send + Sync {
    fn request_consent(&self, device: &DeviceDescriptor, reply: ConsentReply);
}

type PendingSet = Arc<Mutex<HashSet<DeviceId>>>;

fn lock(pending: &PendingSet) -> MutexGuard<'_, HashSet<DeviceId>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct PendingGuard {
    device: DeviceId,
    pending: PendingSet,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.device);
    }
}

/// One-shot answer handle given to a [`ConsentProvider`]
///
/// Dropping it without answering counts as a denial.
#[derive(Debug)]
pub struct ConsentReply {
    tx: oneshot::Sender<Consent>,
    guard: PendingGuard,
}

impl ConsentReply {
    pub fn device(&self) -> DeviceId {
        self.guard.device
    }

    pub fn send(self, consent: Consent) {
        // Requester may have given up
        let _ = self.tx.send(consent);
    }

    pub fn grant(self) {
        self.send(Consent::Granted);
    }

    pub fn deny(self) {
        self.send(Consent::Denied);
    }
}

/// Permission request awaiting its outcome
pub struct PendingPermission {
    device: DeviceDescriptor,
    rx: oneshot::Receiver<Consent>,
    opener: Arc<dyn DeviceOpener>,
}

impl PendingPermission {
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Wait for consent, then open the device if it was granted
    ///
    /// An open refused by the OS resolves as [`PermissionOutcome::Denied`];
    /// any other open failure is returned as an error.
    pub async fn outcome(self) -> Result<PermissionOutcome> {
        let consent = self.rx.await.unwrap_or_else(|_| {
            debug!("Consent reply for {} dropped unanswered", self.device.id);
            Consent::Denied
        });

        match consent {
            Consent::Denied => {
                info!("Permission denied for {}", self.device);
                Ok(PermissionOutcome::Denied)
            }
            Consent::Granted => match open_off_runtime(&self.opener, &self.device).await {
                Ok(handle) => {
                    info!("Permission granted for {}", self.device);
                    Ok(PermissionOutcome::Granted(handle))
                }
                Err(Error::PermissionDenied(id)) => {
                    warn!("OS refused to open {} despite consent", id);
                    Ok(PermissionOutcome::Denied)
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Run a blocking open on the blocking pool
async fn open_off_runtime(
    opener: &Arc<dyn DeviceOpener>,
    device: &DeviceDescriptor,
) -> Result<OpenHandle> {
    let opener = Arc::clone(opener);
    let device = device.clone();
    tokio::task::spawn_blocking(move || opener.open(&device))
        .await
        .map_err(|e| Error::DeviceUnavailable(format!("open task failed: {}", e)))?
}

/// Issues permission requests, one at a time per device
pub struct PermissionNegotiator {
    consent: Arc<dyn ConsentProvider>,
    opener: Arc<dyn DeviceOpener>,
    pending: PendingSet,
}

impl PermissionNegotiator {
    pub fn new(consent: Arc<dyn ConsentProvider>, opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            consent,
            opener,
            pending: Arc::default(),
        }
    }

    /// Ask for consent to open `device`
    ///
    /// Fails fast with [`Error::AlreadyPending`] while an earlier request for
    /// the same device is unresolved.
    pub fn request(&self, device: &DeviceDescriptor) -> Result<PendingPermission> {
        if !lock(&self.pending).insert(device.id) {
            return Err(Error::AlreadyPending(device.id));
        }

        let guard = PendingGuard {
            device: device.id,
            pending: Arc::clone(&self.pending),
        };
        let (tx, rx) = oneshot::channel();

        debug!("Requesting permission for {}", device);
        self.consent
            .request_consent(device, ConsentReply { tx, guard });

        Ok(PendingPermission {
            device: device.clone(),
            rx,
            opener: Arc::clone(&self.opener),
        })
    }

    pub fn is_pending(&self, device: DeviceId) -> bool {
        lock(&self.pending).contains(&device)
    }
}

/// Consent decided by configuration
///
/// Grants every device when `auto_grant` is set, otherwise only devices
/// matching one of the approved filters.
#[derive(Debug, Clone, Default)]
pub struct ConfigConsent {
    auto_grant: bool,
    approved: Vec<DeviceFilter>,
}

impl ConfigConsent {
    pub fn new(auto_grant: bool, approved: Vec<DeviceFilter>) -> Self {
        Self {
            auto_grant,
            approved,
        }
    }

    pub fn allows(&self, device: &DeviceDescriptor) -> bool {
        self.auto_grant
            || self
                .approved
                .iter()
                .any(|f| f.matches(device.vendor_id, device.product_id))
    }
}

impl ConsentProvider for ConfigConsent {
    fn request_consent(&self, device: &DeviceDescriptor, reply: ConsentReply) {
        if self.allows(device) {
            reply.grant();
        } else {
            debug!("{} is not in the approved device list", device);
            reply.deny();
        }
    }
}

/// Consent request forwarded to an interactive front end
#[derive(Debug)]
pub struct ConsentRequest {
    pub device: DeviceDescriptor,
    pub reply: ConsentReply,
}

/// Forwards every request over an event channel
///
/// The receiving side answers through [`ConsentRequest::reply`]. If nobody
/// listens the reply is dropped, which resolves as denied.
#[derive(Debug, Clone)]
pub struct ChannelConsent {
    tx: EventSender<ConsentRequest>,
}

impl ChannelConsent {
    pub fn new(tx: EventSender<ConsentRequest>) -> Self {
        Self { tx }
    }
}

impl ConsentProvider for ChannelConsent {
    fn request_consent(&self, device: &DeviceDescriptor, reply: ConsentReply) {
        self.tx.emit(ConsentRequest {
            device: device.clone(),
            reply,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::event_channel;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockDeviceIo, MockProbe, create_mock_descriptor, with_timeout,
    };

    #[derive(Default)]
    struct MockOpener {
        probes: Mutex<Vec<MockProbe>>,
        refuse: bool,
        opened_on: Mutex<Option<std::thread::ThreadId>>,
    }

    impl DeviceOpener for MockOpener {
        fn open(&self, device: &DeviceDescriptor) -> Result<OpenHandle> {
            *self.opened_on.lock().unwrap() = Some(std::thread::current().id());
            if self.refuse {
                return Err(Error::PermissionDenied(device.id));
            }
            let (io, probe) = MockDeviceIo::new(device.clone());
            self.probes.lock().unwrap().push(probe);
            Ok(Arc::new(io))
        }
    }

    fn channel_negotiator(
        opener: Arc<MockOpener>,
    ) -> (PermissionNegotiator, common::EventReceiver<ConsentRequest>) {
        let (tx, rx) = event_channel();
        (
            PermissionNegotiator::new(Arc::new(ChannelConsent::new(tx)), opener),
            rx,
        )
    }

    #[tokio::test]
    async fn test_second_request_while_pending_fails_fast() {
        let (negotiator, requests) = channel_negotiator(Arc::new(MockOpener::default()));
        let device = create_mock_descriptor(4, 0x18d1, 0x4ee7);

        let first = negotiator.request(&device).unwrap();
        assert!(negotiator.is_pending(device.id));

        match negotiator.request(&device) {
            Err(Error::AlreadyPending(id)) => assert_eq!(id, device.id),
            other => panic!("Expected AlreadyPending, got {:?}", other.map(|_| ())),
        }

        // A different device is unaffected
        let other = create_mock_descriptor(5, 0x18d1, 0x4ee7);
        let _second = negotiator.request(&other).unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.device, device);
        request.reply.grant();

        let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, first.outcome())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, PermissionOutcome::Granted(_)));
        assert!(!negotiator.is_pending(device.id));

        // Resolved, so a fresh request is accepted again
        assert!(negotiator.request(&device).is_ok());
    }

    #[tokio::test]
    async fn test_denied_produces_no_handle() {
        let opener = Arc::new(MockOpener::default());
        let (negotiator, requests) = channel_negotiator(Arc::clone(&opener));
        let device = create_mock_descriptor(2, 0x1234, 0x5678);

        let pending = negotiator.request(&device).unwrap();
        requests.recv().await.unwrap().reply.deny();

        let outcome = pending.outcome().await.unwrap();
        assert!(matches!(outcome, PermissionOutcome::Denied));
        assert!(opener.probes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reply_counts_as_denied() {
        let (negotiator, requests) = channel_negotiator(Arc::new(MockOpener::default()));
        let device = create_mock_descriptor(2, 0x1234, 0x5678);

        let pending = negotiator.request(&device).unwrap();
        drop(requests.recv().await.unwrap());

        assert!(!negotiator.is_pending(device.id));
        assert!(matches!(
            pending.outcome().await.unwrap(),
            PermissionOutcome::Denied
        ));
    }

    #[tokio::test]
    async fn test_grant_outlives_requesting_call() {
        let (negotiator, requests) = channel_negotiator(Arc::new(MockOpener::default()));
        let device = create_mock_descriptor(3, 0x1234, 0x5678);
        let pending = negotiator.request(&device).unwrap();

        let waiter = tokio::spawn(pending.outcome());
        let answer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            requests.recv().await.unwrap().reply.grant();
        });

        let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        answer.await.unwrap();
        match outcome {
            PermissionOutcome::Granted(handle) => assert_eq!(handle.descriptor(), &device),
            PermissionOutcome::Denied => panic!("Expected Granted"),
        }
    }

    #[tokio::test]
    async fn test_os_refusal_is_denied() {
        let opener = Arc::new(MockOpener {
            refuse: true,
            ..Default::default()
        });
        let negotiator = PermissionNegotiator::new(Arc::new(ConfigConsent::new(true, vec![])), opener);
        let device = create_mock_descriptor(1, 0x1234, 0x5678);

        let outcome = negotiator.request(&device).unwrap().outcome().await.unwrap();
        assert!(matches!(outcome, PermissionOutcome::Denied));
    }

    #[tokio::test]
    async fn test_open_runs_off_the_runtime_thread() {
        let opener = Arc::new(MockOpener::default());
        let negotiator = PermissionNegotiator::new(
            Arc::new(ConfigConsent::new(true, vec![])),
            Arc::clone(&opener) as Arc<dyn DeviceOpener>,
        );
        let device = create_mock_descriptor(6, 0x1234, 0x5678);

        let outcome = negotiator.request(&device).unwrap().outcome().await.unwrap();
        assert!(matches!(outcome, PermissionOutcome::Granted(_)));

        let opened_on = opener.opened_on.lock().unwrap().unwrap();
        assert_ne!(opened_on, std::thread::current().id());
    }

    #[test]
    fn test_config_consent() {
        let approved = vec!["0x18d1:*".parse().unwrap()];
        let consent = ConfigConsent::new(false, approved);

        assert!(consent.allows(&create_mock_descriptor(1, 0x18d1, 0x4ee7)));
        assert!(!consent.allows(&create_mock_descriptor(1, 0x1234, 0x4ee7)));
        assert!(ConfigConsent::new(true, vec![]).allows(&create_mock_descriptor(1, 1, 1)));
        assert!(!ConfigConsent::default().allows(&create_mock_descriptor(1, 1, 1)));
    }
}
