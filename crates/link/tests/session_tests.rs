//! Transport Session Integration Tests
//!
//! Drives a [`TransportSession`] end to end against the scripted mock device:
//! permission, claiming, both streaming roles, detach and teardown.
//!
//! Run with: `cargo test -p link --test session_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockDeviceIo, MockProbe, create_mock_descriptor, wait_until,
    with_timeout,
};
use common::{
    Error, EventReceiver, OpenHandle, Result, SessionEvent, SessionId, SessionState,
    event_channel,
};
use link::usb::{
    ChannelConsent, ConfigConsent, ConsentProvider, ConsentRequest, DeviceOpener,
    PermissionNegotiator,
};
use link::{Selection, StreamRole, TransferSettings, TransportSession};
use protocol::{DecodeLimits, DeviceDescriptor, Frame, decode, encode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Harness
// ============================================================================

/// Hands out the mock device once
struct MockOpener(Mutex<Option<MockDeviceIo>>);

impl DeviceOpener for MockOpener {
    fn open(&self, _device: &DeviceDescriptor) -> Result<OpenHandle> {
        let io = self
            .0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::DeviceUnavailable("already opened".into()))?;
        Ok(Arc::new(io))
    }
}

struct Harness {
    session: TransportSession,
    probe: MockProbe,
    device: DeviceDescriptor,
    events: EventReceiver<SessionEvent>,
}

fn harness_with(consent: Arc<dyn ConsentProvider>, settings: TransferSettings) -> Harness {
    let device = create_mock_descriptor(5, 0x18d1, 0x4ee7);
    let (io, probe) = MockDeviceIo::new(device.clone());
    let negotiator =
        PermissionNegotiator::new(consent, Arc::new(MockOpener(Mutex::new(Some(io)))));
    let (tx, events) = event_channel();
    Harness {
        session: TransportSession::new(negotiator, settings, tx),
        probe,
        device,
        events,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(ConfigConsent::new(true, vec![])),
        TransferSettings::default(),
    )
}

async fn connected(h: &Harness) {
    let state = h
        .session
        .connect(&h.device, Selection::Automatic)
        .await
        .expect("connect rejected");
    assert_eq!(state, SessionState::Connected);
    h.events.drain();
}

/// Collect events up to and including the transition to `Idle`
async fn until_idle(events: &EventReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for Idle")
            .expect("channel closed");
        let idle = matches!(
            event,
            SessionEvent::StateChanged {
                to: SessionState::Idle,
                ..
            }
        );
        seen.push(event);
        if idle {
            return seen;
        }
    }
}

/// Consume events on another thread up to `Idle`, noting whether the
/// device was already closed when `Idle` arrived
fn watch_until_idle(h: &Harness) -> std::thread::JoinHandle<(Vec<SessionEvent>, bool)> {
    let events = h.events.clone();
    let probe = h.probe.clone();
    std::thread::spawn(move || {
        let mut seen = Vec::new();
        loop {
            let event = events.recv_blocking().expect("channel closed");
            if let SessionEvent::StateChanged {
                to: SessionState::Idle,
                ..
            } = event
            {
                let closed = probe.is_closed();
                seen.push(event);
                return (seen, closed);
            }
            seen.push(event);
        }
    })
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            SessionEvent::Failed { .. } => None,
        })
        .collect()
}

fn failures(events: &[SessionEvent]) -> Vec<&Error> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Failed { error, .. } => Some(error),
            SessionEvent::StateChanged { .. } => None,
        })
        .collect()
}

fn collecting_sink() -> (StreamRole, Arc<Mutex<Vec<Frame>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let frames = Arc::clone(&frames);
        move |frame: Frame| frames.lock().unwrap().push(frame)
    };
    (StreamRole::Receiver(Box::new(sink)), frames)
}

fn push_frame(probe: &MockProbe, frame: &Frame) {
    for chunk in encode(frame, 512).unwrap() {
        probe.push_read(chunk.to_bytes().to_vec());
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_claim_busy_fails_to_idle() {
    let h = harness();
    h.probe.set_claim_busy(true);

    let state = h
        .session
        .connect(&h.device, Selection::Automatic)
        .await
        .unwrap();
    assert_eq!(state, SessionState::Idle);

    let events = h.events.drain();
    assert_eq!(
        states(&events),
        vec![
            SessionState::AwaitingPermission,
            SessionState::Error,
            SessionState::Idle,
        ]
    );
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::ClaimFailed { interface: 0, .. }));
    assert!(h.probe.is_closed());
    assert!(h.session.device().is_none());
}

#[tokio::test]
async fn test_packet_too_small_for_header_rejected() {
    let device = create_mock_descriptor(6, 0x18d1, 0x4ee7);
    let (io, probe) = MockDeviceIo::with_max_packet(device.clone(), 16);
    let negotiator = PermissionNegotiator::new(
        Arc::new(ConfigConsent::new(true, vec![])),
        Arc::new(MockOpener(Mutex::new(Some(io)))),
    );
    let (tx, events) = event_channel();
    let session = TransportSession::new(negotiator, TransferSettings::default(), tx);

    let state = session.connect(&device, Selection::Automatic).await.unwrap();
    assert_eq!(state, SessionState::Idle);
    assert_eq!(probe.claimed(), None);
    assert!(probe.is_closed());

    let events = events.drain();
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::DeviceUnavailable(_)));
    assert!(!states(&events).contains(&SessionState::Connected));
}

#[tokio::test]
async fn test_interactive_consent_grants() {
    let (consent_tx, consent_rx) = event_channel::<ConsentRequest>();
    let h = harness_with(
        Arc::new(ChannelConsent::new(consent_tx)),
        TransferSettings::default(),
    );

    let connect = tokio::spawn({
        let session = h.session.clone();
        let device = h.device.clone();
        async move { session.connect(&device, Selection::User).await }
    });

    let request = with_timeout(DEFAULT_TEST_TIMEOUT, consent_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.device, h.device);
    assert_eq!(h.session.current_state(), SessionState::AwaitingPermission);
    request.reply.grant();

    let state = connect.await.unwrap().unwrap();
    assert_eq!(state, SessionState::Connected);
    assert_eq!(h.probe.claimed(), Some(0));

    h.session.stop_session();
    assert!(h.probe.is_closed());
}

#[tokio::test]
async fn test_detach_while_awaiting_permission() {
    let (consent_tx, consent_rx) = event_channel::<ConsentRequest>();
    let h = harness_with(
        Arc::new(ChannelConsent::new(consent_tx)),
        TransferSettings::default(),
    );

    let connect = tokio::spawn({
        let session = h.session.clone();
        let device = h.device.clone();
        async move { session.connect(&device, Selection::Automatic).await }
    });
    let request = with_timeout(DEFAULT_TEST_TIMEOUT, consent_rx.recv())
        .await
        .unwrap()
        .unwrap();

    h.session.handle_detach(h.device.id);
    assert_eq!(h.session.current_state(), SessionState::Idle);

    // Consent arriving after the attempt ended does not revive it
    request.reply.grant();
    assert_eq!(connect.await.unwrap().unwrap(), SessionState::Idle);
    assert_eq!(h.session.current_state(), SessionState::Idle);
    assert!(h.probe.is_closed());
    assert_eq!(h.probe.claimed(), None);

    let events = h.events.drain();
    assert_eq!(
        states(&events),
        vec![
            SessionState::AwaitingPermission,
            SessionState::Error,
            SessionState::Idle,
        ]
    );
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::DeviceUnavailable(_)));
}

#[tokio::test]
async fn test_session_ids_increase_per_attempt() {
    let h = harness();
    connected(&h).await;
    let first = h.session.session_id();
    h.session.stop_session();

    // The mock opens once, so the second attempt fails after its request
    let state = h
        .session
        .connect(&h.device, Selection::Automatic)
        .await
        .unwrap();
    assert_eq!(state, SessionState::Idle);
    assert_eq!(h.session.session_id(), SessionId(first.0 + 1));
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[tokio::test]
async fn test_submit_requires_sender_streaming() {
    let h = harness();
    connected(&h).await;

    assert!(matches!(
        h.session.submit(Frame::new(0, vec![1, 2, 3])),
        Err(Error::StateViolation {
            state: SessionState::Connected,
            ..
        })
    ));

    let (role, _frames) = collecting_sink();
    h.session.start_session(role).unwrap();
    assert!(matches!(
        h.session.submit(Frame::new(0, vec![1, 2, 3])),
        Err(Error::StateViolation {
            state: SessionState::Streaming,
            ..
        })
    ));

    h.session.stop_session();
}

#[tokio::test]
async fn test_sender_replaces_pending_frame() {
    let h = harness_with(
        Arc::new(ConfigConsent::new(true, vec![])),
        TransferSettings {
            write_timeout: DEFAULT_TEST_TIMEOUT,
            ..Default::default()
        },
    );
    connected(&h).await;
    h.session.start_session(StreamRole::Sender).unwrap();

    let a = Frame::new(1, vec![0xA; 1100]);
    let b = Frame::new(2, vec![0xB; 600]);
    let c = Frame::new(3, vec![0xC; 900]);

    h.probe.close_gate();
    h.session.submit(a.clone()).unwrap();
    // Let the worker pick A up and stall on its first chunk
    std::thread::sleep(Duration::from_millis(100));
    h.session.submit(b).unwrap();
    h.session.submit(c.clone()).unwrap();
    h.probe.open_gate();

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        h.session.stream_stats().map(|s| s.frames) == Some(2)
    }));
    let stats = h.session.stream_stats().unwrap();
    assert_eq!(stats.dropped, 1);

    let written: Vec<Frame> = decode(h.probe.writes(), DecodeLimits::default()).collect();
    assert_eq!(written, vec![a, c]);

    h.session.stop_session();
    assert_eq!(h.session.current_state(), SessionState::Idle);
}

#[tokio::test]
async fn test_receiver_delivers_then_zero_length_read_fails() {
    let h = harness();
    connected(&h).await;

    let (role, frames) = collecting_sink();
    h.session.start_session(role).unwrap();

    let first = Frame::new(10, vec![7; 1500]);
    let second = Frame::new(11, Vec::<u8>::new());
    push_frame(&h.probe, &first);
    push_frame(&h.probe, &second);
    h.probe.push_zero_length();

    let events = until_idle(&h.events).await;
    assert_eq!(*frames.lock().unwrap(), vec![first, second]);

    assert_eq!(
        states(&events),
        vec![
            SessionState::Streaming,
            SessionState::Error,
            SessionState::Closing,
            SessionState::Idle,
        ]
    );
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::TransferError { .. }));
    assert!(h.probe.is_closed());
}

#[tokio::test]
async fn test_worker_error_reported_once() {
    let h = harness();
    connected(&h).await;

    let (role, _frames) = collecting_sink();
    h.session.start_session(role).unwrap();
    h.probe.push_read_failure();

    let events = until_idle(&h.events).await;
    assert_eq!(failures(&events).len(), 1);

    // Everything after the teardown is a no-op
    h.session.stop_session();
    h.session.handle_detach(h.device.id);
    assert!(h.events.drain().is_empty());
}

#[tokio::test]
async fn test_stop_latency_bounded_by_read_timeout() {
    let h = harness_with(
        Arc::new(ConfigConsent::new(true, vec![])),
        TransferSettings {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    connected(&h).await;

    let (role, _frames) = collecting_sink();
    h.session.start_session(role).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    h.session.stop_session();
    let elapsed = started.elapsed();

    assert_eq!(h.session.current_state(), SessionState::Idle);
    assert!(h.probe.is_closed());
    assert!(
        elapsed < Duration::from_millis(500),
        "stop took {:?}",
        elapsed
    );

    let events = h.events.drain();
    assert!(failures(&events).is_empty());
    assert_eq!(
        states(&events),
        vec![
            SessionState::Streaming,
            SessionState::Closing,
            SessionState::Idle
        ]
    );
}

// ============================================================================
// Detach Tests
// ============================================================================

#[tokio::test]
async fn test_unplug_while_streaming_closes_before_idle() {
    let h = harness();
    connected(&h).await;

    let (role, _frames) = collecting_sink();
    h.session.start_session(role).unwrap();
    h.events.drain();
    let watcher = watch_until_idle(&h);

    // Transfers fail first, the hot-plug event follows
    h.probe.detach();
    let (events, closed_at_idle) = watcher.join().unwrap();
    assert!(closed_at_idle);
    assert_eq!(h.probe.released(), vec![0]);

    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::DeviceUnavailable(_)));

    h.session.handle_detach(h.device.id);
    assert!(h.events.drain().is_empty());
    assert_eq!(h.session.current_state(), SessionState::Idle);
}

#[tokio::test]
async fn test_detach_event_while_streaming() {
    let h = harness();
    connected(&h).await;
    h.session.start_session(StreamRole::Sender).unwrap();
    h.events.drain();
    let watcher = watch_until_idle(&h);

    h.session.handle_detach(h.device.id);
    assert_eq!(h.session.current_state(), SessionState::Idle);

    let (events, closed_at_idle) = watcher.join().unwrap();
    assert!(closed_at_idle);
    assert_eq!(
        states(&events),
        vec![
            SessionState::Error,
            SessionState::Closing,
            SessionState::Idle
        ]
    );
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::DeviceUnavailable(_)));
}
