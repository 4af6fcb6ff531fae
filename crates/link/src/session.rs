//! Transport session
//!
//! Owns the connection to one device and runs the state machine
//!
//! ```text
//! Idle -> AwaitingPermission -> Connected -> Streaming -> Closing -> Idle
//! ```
//!
//! with `Error` passed through on the way back to `Idle` whenever a terminal
//! error ends the attempt. Every transition is published as a
//! [`SessionEvent::StateChanged`] and every terminal error exactly once as a
//! [`SessionEvent::Failed`].
//!
//! The handle and the claimed interface belong to the session. While
//! `Streaming`, one worker holds a clone of the handle; closing stops the
//! worker, joins it, then releases the interface and drops the handle, so the
//! device is closed before `Idle` is reported. There is no global session:
//! each [`TransportSession`] is an independent state machine.

use crate::stream::{FrameReceiver, FrameSender, FrameSink, StreamStatsSnapshot, TransferSettings};
use crate::usb::permission::{PermissionNegotiator, PermissionOutcome};
use common::{
    Error, EventSender, OpenHandle, ResolvedInterface, Result, Role, SessionEvent, SessionId,
    SessionState,
};
use protocol::{DeviceDescriptor, DeviceId, Frame, max_chunk_payload};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Who picked the device for a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Chosen by the application, e.g. on attach or at startup
    Automatic,
    /// Explicit user action; clears an earlier denial for the device
    User,
}

/// Role to start streaming with
pub enum StreamRole {
    Sender,
    /// Completed frames go to the sink on the receiver thread
    Receiver(Box<dyn FrameSink>),
}

impl StreamRole {
    pub fn role(&self) -> Role {
        match self {
            Self::Sender => Role::Sender,
            Self::Receiver(_) => Role::Receiver,
        }
    }
}

impl fmt::Debug for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.role())
    }
}

struct Connection {
    handle: OpenHandle,
    interface: ResolvedInterface,
}

enum ActiveRole {
    Sender(FrameSender),
    Receiver(FrameReceiver),
}

struct Worker {
    role: ActiveRole,
    thread: JoinHandle<()>,
}

impl Worker {
    fn stats(&self) -> StreamStatsSnapshot {
        match &self.role {
            ActiveRole::Sender(sender) => sender.stats().snapshot(),
            ActiveRole::Receiver(receiver) => receiver.stats().snapshot(),
        }
    }

    fn stop_and_join(self) {
        match &self.role {
            ActiveRole::Sender(sender) => sender.shutdown(),
            ActiveRole::Receiver(receiver) => receiver.shutdown(),
        }
        if self.thread.join().is_err() {
            error!("Streaming worker panicked");
        }
    }
}

struct Inner {
    state: SessionState,
    id: SessionId,
    device: Option<DeviceDescriptor>,
    connection: Option<Connection>,
    worker: Option<Worker>,
    /// Devices refused consent; only a user selection retries them
    denied: HashSet<DeviceId>,
}

struct Shared {
    inner: Mutex<Inner>,
    negotiator: PermissionNegotiator,
    settings: TransferSettings,
    events: EventSender<SessionEvent>,
}

/// Connection state machine for one device at a time
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<Shared>,
}

impl TransportSession {
    pub fn new(
        negotiator: PermissionNegotiator,
        settings: TransferSettings,
        events: EventSender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    id: SessionId(0),
                    device: None,
                    connection: None,
                    worker: None,
                    denied: HashSet::new(),
                }),
                negotiator,
                settings,
                events,
            }),
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Identifier of the latest connection attempt
    pub fn session_id(&self) -> SessionId {
        self.shared.lock().id
    }

    /// Device bound to the session, if any
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.shared.lock().device.clone()
    }

    /// Counters of the running worker
    pub fn stream_stats(&self) -> Option<StreamStatsSnapshot> {
        self.shared.lock().worker.as_ref().map(Worker::stats)
    }

    /// Request permission for `device`, then open it and claim its interface
    ///
    /// Only valid while `Idle`. Fails fast with [`Error::AlreadyPending`] if
    /// the negotiator still has a request for the device, and with
    /// [`Error::PermissionDenied`] for an automatic selection of a device that
    /// was refused before. Failures after the request was issued are reported
    /// as [`SessionEvent::Failed`]; the returned state is where the attempt
    /// ended (`Connected` or `Idle`).
    pub async fn connect(
        &self,
        device: &DeviceDescriptor,
        selection: Selection,
    ) -> Result<SessionState> {
        let (attempt, pending) = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Idle {
                return Err(Error::StateViolation {
                    operation: "connect",
                    state: inner.state,
                });
            }

            match selection {
                Selection::User => {
                    inner.denied.remove(&device.id);
                }
                Selection::Automatic if inner.denied.contains(&device.id) => {
                    debug!("Not retrying {} without a user action", device);
                    return Err(Error::PermissionDenied(device.id));
                }
                Selection::Automatic => {}
            }

            let pending = self.shared.negotiator.request(device)?;
            inner.id = SessionId(inner.id.0 + 1);
            inner.device = Some(device.clone());
            self.shared
                .transition(&mut inner, SessionState::AwaitingPermission);
            (inner.id, pending)
        };

        let outcome = pending.outcome().await;

        let mut inner = self.shared.lock();
        if inner.id != attempt || inner.state != SessionState::AwaitingPermission {
            debug!(
                "Permission outcome for session {} arrived after it ended",
                attempt
            );
            return Ok(inner.state);
        }

        let handle = match outcome {
            Ok(PermissionOutcome::Granted(handle)) => handle,
            Ok(PermissionOutcome::Denied) => {
                inner.denied.insert(device.id);
                self.shared
                    .fail(inner, Error::PermissionDenied(device.id));
                return Ok(SessionState::Idle);
            }
            Err(e) => {
                self.shared.fail(inner, e);
                return Ok(SessionState::Idle);
            }
        };

        let claimed = handle.resolve_interface().and_then(|interface| {
            check_packet_sizes(&interface)?;
            handle.claim_interface(interface.number)?;
            Ok(interface)
        });

        match claimed {
            Ok(interface) => {
                info!(
                    "Session {} claimed interface {} on {}",
                    attempt, interface.number, device
                );
                inner.connection = Some(Connection { handle, interface });
                self.shared.transition(&mut inner, SessionState::Connected);
                Ok(SessionState::Connected)
            }
            Err(e) => {
                drop(handle);
                self.shared.fail(inner, e);
                Ok(SessionState::Idle)
            }
        }
    }

    /// Start streaming in `role`; only valid while `Connected`
    pub fn start_session(&self, role: StreamRole) -> Result<()> {
        let mut inner = self.shared.lock();
        let (handle, interface) = match (&inner.connection, inner.state) {
            (Some(conn), SessionState::Connected) => (Arc::clone(&conn.handle), conn.interface),
            (_, state) => {
                return Err(Error::StateViolation {
                    operation: "start streaming",
                    state,
                });
            }
        };

        let session = inner.id;
        let kind = role.role();
        let stop = Arc::new(AtomicBool::new(false));
        let on_exit = {
            let shared = Arc::clone(&self.shared);
            move |result| shared.worker_exited(session, result)
        };
        let settings = self.shared.settings;

        // Lock is held until Streaming is set, so on_exit cannot run first
        let worker = match role {
            StreamRole::Sender => {
                let (sender, thread) =
                    FrameSender::spawn(handle, interface.output, settings, stop, on_exit)?;
                Worker {
                    role: ActiveRole::Sender(sender),
                    thread,
                }
            }
            StreamRole::Receiver(sink) => {
                let (receiver, thread) =
                    FrameReceiver::spawn(handle, interface.input, settings, stop, sink, on_exit)?;
                Worker {
                    role: ActiveRole::Receiver(receiver),
                    thread,
                }
            }
        };

        info!("Session {} streaming as {}", session, kind);
        inner.worker = Some(worker);
        self.shared.transition(&mut inner, SessionState::Streaming);
        Ok(())
    }

    /// Queue a frame for sending; only valid while streaming as sender
    pub fn submit(&self, frame: Frame) -> Result<()> {
        let inner = self.shared.lock();
        match (&inner.worker, inner.state) {
            (
                Some(Worker {
                    role: ActiveRole::Sender(sender),
                    ..
                }),
                SessionState::Streaming,
            ) => sender.submit(frame),
            (_, state) => Err(Error::StateViolation {
                operation: "submit a frame",
                state,
            }),
        }
    }

    /// Stop streaming and close the device
    ///
    /// Returns once the worker has exited and the handle is closed. Calling
    /// it while `Idle` or while another close is running does nothing.
    pub fn stop_session(&self) {
        let inner = self.shared.lock();
        match inner.state {
            SessionState::Idle | SessionState::Closing | SessionState::Error => {
                debug!("Stop requested while {}", inner.state);
            }
            _ => {
                info!("Stopping session {}", inner.id);
                self.shared.close(inner, None);
            }
        }
    }

    /// React to a device leaving the bus
    ///
    /// Honored in every state; a no-op unless `device` is the bound device.
    pub fn handle_detach(&self, device: DeviceId) {
        let mut inner = self.shared.lock();
        // A replugged device is a fresh start
        inner.denied.remove(&device);

        if inner.device.as_ref().map(|d| d.id) != Some(device) {
            return;
        }
        match inner.state {
            SessionState::Idle | SessionState::Closing | SessionState::Error => {}
            _ => {
                info!("Device {} detached from session {}", device, inner.id);
                self.shared.close(
                    inner,
                    Some(Error::DeviceUnavailable(format!("device {} detached", device))),
                );
            }
        }
    }
}

/// Both endpoints must fit a chunk header plus at least one payload byte
fn check_packet_sizes(interface: &ResolvedInterface) -> Result<()> {
    for endpoint in [interface.input, interface.output] {
        if let Err(e) = max_chunk_payload(endpoint.max_packet_size as usize) {
            return Err(Error::DeviceUnavailable(format!(
                "endpoint {:#04x} unusable: {}",
                endpoint.address, e
            )));
        }
    }
    Ok(())
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, inner: &mut Inner, to: SessionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        info!("Session {}: {} -> {}", inner.id, from, to);
        self.events.emit(SessionEvent::StateChanged {
            session: inner.id,
            from,
            to,
        });
    }

    /// Report a terminal error and unwind to `Idle`
    fn fail(&self, inner: MutexGuard<'_, Inner>, error: Error) {
        self.close(inner, Some(error));
    }

    /// Tear the session down to `Idle`
    ///
    /// The lock is released while the worker is joined, so the worker's own
    /// exit path can observe `Closing` and leave the cleanup to us.
    fn close(&self, mut inner: MutexGuard<'_, Inner>, failure: Option<Error>) {
        let session = inner.id;

        if let Some(error) = failure {
            warn!("Session {} failed: {}", session, error);
            self.transition(&mut inner, SessionState::Error);
            self.events.emit(SessionEvent::Failed { session, error });
        }

        let worker = inner.worker.take();
        let connection = inner.connection.take();
        if worker.is_some() || connection.is_some() {
            self.transition(&mut inner, SessionState::Closing);
        }
        drop(inner);

        if let Some(worker) = worker {
            let stats = worker.stats();
            worker.stop_and_join();
            debug!(
                "Session {} worker joined: {} frames, {} dropped, {} resyncs",
                session, stats.frames, stats.dropped, stats.resyncs
            );
        }

        if let Some(Connection { handle, interface }) = connection {
            if let Err(e) = handle.release_interface(interface.number) {
                debug!("Could not release interface {}: {}", interface.number, e);
            }
            drop(handle);
        }

        let mut inner = self.lock();
        inner.device = None;
        self.transition(&mut inner, SessionState::Idle);
    }

    /// Exit path of a streaming worker
    fn worker_exited(&self, session: SessionId, result: Result<()>) {
        let mut inner = self.lock();
        if inner.id != session || inner.state != SessionState::Streaming {
            // Someone else is closing and will join us
            if let Err(e) = result {
                debug!("Worker of session {} ended during close: {}", session, e);
            }
            return;
        }

        // Running on the worker thread: it cannot join itself
        drop(inner.worker.take());
        match result {
            Ok(()) => self.close(inner, None),
            Err(e) => self.close(inner, Some(e)),
        }
    }
}
