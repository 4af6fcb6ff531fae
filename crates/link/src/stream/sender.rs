//! Frame sender (emitter role)
//!
//! Producers hand frames to [`FrameSender::submit`], which only swaps the
//! frame into a one-deep pending slot. The worker takes whatever is pending,
//! encodes it and writes the chunks in order. A frame submitted while another
//! is still pending replaces it, so at most one frame is in flight and one
//! waits; everything in between is dropped.

use super::{StreamStats, TransferSettings, spawn_worker};
use common::{Error, OpenHandle, Result};
use protocol::{EndpointDescriptor, Frame, encode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest the idle worker sleeps before rechecking the stop flag
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct PendingSlot {
    frame: Mutex<Option<Frame>>,
    ready: Condvar,
}

impl PendingSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.frame.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `frame`, returning the frame it replaced
    fn put(&self, frame: Frame) -> Option<Frame> {
        let replaced = self.lock().replace(frame);
        self.ready.notify_one();
        replaced
    }

    /// Wait for a pending frame; `None` once `stop` is set
    fn take(&self, stop: &AtomicBool) -> Option<Frame> {
        let mut slot = self.lock();
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(frame) = slot.take() {
                return Some(frame);
            }
            slot = self
                .ready
                .wait_timeout(slot, IDLE_WAIT)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

/// Producer-side handle of a running sender worker
#[derive(Debug)]
pub struct FrameSender {
    slot: Arc<PendingSlot>,
    stop: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    max_frame_bytes: usize,
}

impl FrameSender {
    /// Start the worker writing to `endpoint`
    ///
    /// `on_exit` runs on the worker thread after the loop ends and the
    /// worker's handle clone has been dropped.
    pub fn spawn<E>(
        handle: OpenHandle,
        endpoint: EndpointDescriptor,
        settings: TransferSettings,
        stop: Arc<AtomicBool>,
        on_exit: E,
    ) -> Result<(Self, JoinHandle<()>)>
    where
        E: FnOnce(Result<()>) + Send + 'static,
    {
        let sender = Self {
            slot: Arc::default(),
            stop,
            stats: Arc::default(),
            max_frame_bytes: settings.max_frame_bytes,
        };

        let worker = SendLoop {
            handle,
            endpoint,
            write_timeout: settings.write_timeout,
            slot: Arc::clone(&sender.slot),
            stop: Arc::clone(&sender.stop),
            stats: Arc::clone(&sender.stats),
        };
        let thread = spawn_worker("frame-sender", endpoint.address, move || worker.run(), on_exit)?;

        Ok((sender, thread))
    }

    /// Hand a frame to the worker without waiting for it to be written
    ///
    /// Replaces any frame still pending. Frames larger than the configured
    /// maximum are rejected.
    pub fn submit(&self, frame: Frame) -> Result<()> {
        if frame.len() > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
        }

        if let Some(replaced) = self.slot.put(frame) {
            debug!("Frame {} replaced before sending", replaced.sequence());
            self.stats.add_dropped(1);
        }
        Ok(())
    }

    /// Whether a submitted frame is still waiting for the worker
    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Ask the worker to stop and wake it if idle
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.slot.ready.notify_all();
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }
}

struct SendLoop {
    handle: OpenHandle,
    endpoint: EndpointDescriptor,
    write_timeout: Duration,
    slot: Arc<PendingSlot>,
    stop: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
}

impl SendLoop {
    fn run(self) -> Result<()> {
        info!(
            "Sender started on endpoint {:#04x} ({} byte packets)",
            self.endpoint.address, self.endpoint.max_packet_size
        );

        while let Some(frame) = self.slot.take(&self.stop) {
            if !self.write_frame(&frame)? {
                break;
            }
            self.stats.add_frames(1);
        }

        info!("Sender stopped");
        Ok(())
    }

    /// Write every chunk of `frame`; `false` if stopped part way
    fn write_frame(&self, frame: &Frame) -> Result<bool> {
        let chunks = encode(frame, self.endpoint.max_packet_size as usize)?;

        for chunk in &chunks {
            if self.stop.load(Ordering::SeqCst) {
                debug!("Stopped while sending frame {}", frame.sequence());
                return Ok(false);
            }

            let bytes = chunk.to_bytes();
            let written = self
                .handle
                .write_bulk(&self.endpoint, &bytes, self.write_timeout)
                .inspect_err(|e| warn!("Aborting frame {}: {}", frame.sequence(), e))?;

            if written != bytes.len() {
                warn!(
                    "Aborting frame {}: short write ({} of {} bytes)",
                    frame.sequence(),
                    written,
                    bytes.len()
                );
                return Err(Error::TransferError {
                    endpoint: self.endpoint.address,
                    reason: format!("short write: {} of {} bytes", written, bytes.len()),
                });
            }
        }

        debug!(
            "Sent frame {} ({} bytes, {} chunks)",
            frame.sequence(),
            frame.len(),
            chunks.len()
        );
        Ok(true)
    }
}
