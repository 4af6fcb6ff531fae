//! Streaming roles
//!
//! A streaming session runs exactly one worker thread, either a
//! [`FrameSender`] or a [`FrameReceiver`]. Workers own a clone of the device
//! handle for as long as they run and drop it before reporting their exit.
//! Cancellation is cooperative: the stop flag is checked after every blocking
//! transfer returns, so stopping takes at most one transfer timeout.

mod receiver;
mod sender;

pub use receiver::{FrameReceiver, FrameSink};
pub use sender::FrameSender;

use common::{Error, Result};
use protocol::MAX_FRAME_LEN;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;

/// Timeouts and limits applied by the streaming workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Timeout for each bulk OUT write
    pub write_timeout: Duration,
    /// Timeout for each bulk IN read; bounds how long a stop takes to be seen
    pub read_timeout: Duration,
    /// Largest frame accepted for sending or reassembly
    pub max_frame_bytes: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(50),
            max_frame_bytes: MAX_FRAME_LEN,
        }
    }
}

/// Counters shared between a worker and the session
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    dropped: AtomicU64,
    resyncs: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    /// Frames written in full (sender) or delivered to the sink (receiver)
    pub frames: u64,
    /// Frames replaced before sending, or partial frames discarded on receive
    pub dropped: u64,
    /// Times the receive stream lost sync
    pub resyncs: u64,
}

impl StreamStats {
    pub(crate) fn add_frames(&self, n: u64) {
        self.frames.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_resyncs(&self, n: u64) {
        self.resyncs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a named worker thread
///
/// `body` runs the transfer loop and owns everything it captured, including
/// its handle clone; those are dropped before `on_exit` sees the result. A
/// panic in `body` is reported as a transfer error on `endpoint`.
pub(crate) fn spawn_worker<B, E>(
    name: &str,
    endpoint: u8,
    body: B,
    on_exit: E,
) -> Result<JoinHandle<()>>
where
    B: FnOnce() -> Result<()> + Send + 'static,
    E: FnOnce(Result<()>) + Send + 'static,
{
    let thread_name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|e| {
                error!("Panic in {} worker: {:?}", thread_name, e);
                Err(Error::TransferError {
                    endpoint,
                    reason: "worker panicked".to_string(),
                })
            });
            on_exit(result);
        })?;
    Ok(handle)
}
