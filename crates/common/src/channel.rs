//! Event channels between USB threads and the application
//!
//! Hot-plug callbacks and transfer workers run on blocking threads and must
//! never stall on a slow consumer, so events travel over unbounded channels and
//! are emitted with a non-blocking send. Consumers may await events from a
//! Tokio task or block on them from a plain thread. Events on one channel are
//! delivered in the order they were emitted.

use crate::error::Error;
use crate::state::{SessionId, SessionState};
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use protocol::{DeviceDescriptor, DeviceId};
use tracing::debug;

/// Hot-plug events translated from the host bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Matching device plugged in (or present at startup)
    Attached(DeviceDescriptor),
    /// Device removed
    Detached(DeviceId),
}

/// Notifications from a transport session
#[derive(Debug)]
pub enum SessionEvent {
    /// State machine transition
    StateChanged {
        session: SessionId,
        from: SessionState,
        to: SessionState,
    },
    /// Terminal error, reported exactly once per session
    Failed { session: SessionId, error: Error },
}

/// Producing half of an event channel
#[derive(Debug)]
pub struct EventSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: std::fmt::Debug> EventSender<T> {
    /// Emit an event without blocking
    ///
    /// Returns `false` if every receiver is gone; the event is dropped.
    pub fn emit(&self, event: T) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping event, no receiver: {:?}", e.into_inner());
                false
            }
        }
    }
}

/// Consuming half of an event channel
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for EventReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> EventReceiver<T> {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<T> {
        self.rx
            .recv()
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Wait for the next event from a blocking thread
    pub fn recv_blocking(&self) -> crate::Result<T> {
        self.rx
            .recv_blocking()
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain every queued event
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create an unbounded event channel
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}
