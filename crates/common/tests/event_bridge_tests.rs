//! Event Channel Integration Tests
//!
//! Tests for the channels carrying hot-plug and session events from blocking
//! USB threads to async consumers.
//!
//! Run with: `cargo test -p common --test event_bridge_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_descriptor_list, with_timeout};
use common::{DiscoveryEvent, Error, SessionEvent, SessionId, SessionState, event_channel};
use std::thread;

// ============================================================================
// Delivery Order Tests
// ============================================================================

#[tokio::test]
async fn test_attach_detach_order_preserved_across_threads() {
    let (tx, rx) = event_channel();
    let devices = create_mock_descriptor_list(4);
    let expected = devices.clone();

    let producer = thread::spawn(move || {
        for device in devices {
            let id = device.id;
            tx.emit(DiscoveryEvent::Attached(device));
            tx.emit(DiscoveryEvent::Detached(id));
        }
    });

    for device in expected {
        let attached = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(attached, DiscoveryEvent::Attached(device.clone()));

        let detached = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(detached, DiscoveryEvent::Detached(device.id));
    }

    producer.join().expect("producer panicked");
}

#[tokio::test]
async fn test_recv_fails_once_senders_are_gone() {
    let (tx, rx) = event_channel::<DiscoveryEvent>();
    drop(tx);

    let result = rx.recv().await;
    assert!(matches!(result, Err(Error::Channel(_))));
}

// ============================================================================
// Session Event Tests
// ============================================================================

#[test]
fn test_session_events_from_blocking_consumer() {
    let (tx, rx) = event_channel();
    let session = SessionId(7);

    let worker = thread::spawn(move || {
        tx.emit(SessionEvent::StateChanged {
            session,
            from: SessionState::Streaming,
            to: SessionState::Error,
        });
        tx.emit(SessionEvent::Failed {
            session,
            error: Error::TransferTimeout { endpoint: 0x01 },
        });
    });
    worker.join().expect("worker panicked");

    match rx.recv_blocking().expect("event") {
        SessionEvent::StateChanged { from, to, .. } => {
            assert_eq!(from, SessionState::Streaming);
            assert_eq!(to, SessionState::Error);
        }
        other => panic!("Expected StateChanged, got {:?}", other),
    }

    match rx.recv_blocking().expect("event") {
        SessionEvent::Failed { session: id, error } => {
            assert_eq!(id, session);
            assert!(error.is_terminal());
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
}

#[test]
fn test_emit_never_blocks_on_slow_consumer() {
    let (tx, rx) = event_channel();
    for i in 0..10_000u32 {
        assert!(tx.emit(i));
    }
    assert_eq!(rx.drain().len(), 10_000);
}
