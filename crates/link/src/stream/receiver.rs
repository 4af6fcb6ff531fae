//! Frame receiver (receiver role)
//!
//! Reads one packet-sized buffer at a time from the bulk IN endpoint, feeds
//! it to the frame decoder and hands every completed frame to the sink on the
//! worker thread. A read that times out just loops, so a stop request is seen
//! within one read timeout (50 ms by default). A zero-length read or any
//! other read failure ends the loop and is reported to the session.

use super::{StreamStats, TransferSettings, spawn_worker};
use common::{Error, OpenHandle, Result};
use protocol::{DecodeLimits, DecoderStats, EndpointDescriptor, Frame, FrameDecoder};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Consumer of reassembled frames
///
/// Called on the receiver thread. A slow sink stalls the link.
pub trait FrameSink: Send {
    fn deliver(&mut self, frame: Frame);
}

impl<F> FrameSink for F
where
    F: FnMut(Frame) + Send,
{
    fn deliver(&mut self, frame: Frame) {
        self(frame)
    }
}

/// Handle of a running receiver worker
#[derive(Debug)]
pub struct FrameReceiver {
    stop: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
}

impl FrameReceiver {
    /// Start the worker reading from `endpoint`
    ///
    /// `on_exit` runs on the worker thread after the loop ends and the
    /// worker's handle clone has been dropped.
    pub fn spawn<E>(
        handle: OpenHandle,
        endpoint: EndpointDescriptor,
        settings: TransferSettings,
        stop: Arc<AtomicBool>,
        sink: Box<dyn FrameSink>,
        on_exit: E,
    ) -> Result<(Self, JoinHandle<()>)>
    where
        E: FnOnce(Result<()>) + Send + 'static,
    {
        let receiver = Self {
            stop,
            stats: Arc::default(),
        };

        let worker = ReceiveLoop {
            handle,
            endpoint,
            read_timeout: settings.read_timeout,
            decoder: FrameDecoder::new(DecodeLimits {
                max_frame_len: settings.max_frame_bytes,
            }),
            seen: DecoderStats::default(),
            sink,
            stop: Arc::clone(&receiver.stop),
            stats: Arc::clone(&receiver.stats),
        };
        let thread = spawn_worker(
            "frame-receiver",
            endpoint.address,
            move || worker.run(),
            on_exit,
        )?;

        Ok((receiver, thread))
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }
}

struct ReceiveLoop {
    handle: OpenHandle,
    endpoint: EndpointDescriptor,
    read_timeout: Duration,
    decoder: FrameDecoder,
    /// Decoder counters already folded into `stats`
    seen: DecoderStats,
    sink: Box<dyn FrameSink>,
    stop: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
}

impl ReceiveLoop {
    fn run(mut self) -> Result<()> {
        info!(
            "Receiver started on endpoint {:#04x} ({} byte packets)",
            self.endpoint.address, self.endpoint.max_packet_size
        );

        let mut buf = vec![0u8; self.endpoint.max_packet_size as usize];
        let result = self.read_until_stopped(&mut buf);

        let stats = self.decoder.stats();
        info!(
            "Receiver stopped: {} frames, {} discarded, {} resyncs",
            stats.frames_completed, stats.frames_discarded, stats.resyncs
        );
        result
    }

    fn read_until_stopped(&mut self, buf: &mut [u8]) -> Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            let n = match self.handle.read_bulk(&self.endpoint, buf, self.read_timeout) {
                Ok(0) => {
                    warn!("Zero-length read on endpoint {:#04x}", self.endpoint.address);
                    return Err(Error::TransferError {
                        endpoint: self.endpoint.address,
                        reason: "zero-length read".to_string(),
                    });
                }
                Ok(n) => n,
                Err(Error::TransferTimeout { .. }) => continue,
                Err(e) => {
                    warn!("Read failed on endpoint {:#04x}: {}", self.endpoint.address, e);
                    return Err(e);
                }
            };

            trace!("Read {} bytes", n);
            let frames = self.decoder.push(&buf[..n]);
            self.account();

            for frame in frames {
                debug!("Received frame {} ({} bytes)", frame.sequence(), frame.len());
                self.stats.add_frames(1);
                self.sink.deliver(frame);
            }
        }
        Ok(())
    }

    /// Fold new decoder counters into the shared stats
    fn account(&mut self) {
        let now = self.decoder.stats();

        let resyncs = now.resyncs - self.seen.resyncs;
        if resyncs > 0 {
            let resync = Error::DecodeResync {
                skipped: now.bytes_skipped - self.seen.bytes_skipped,
            };
            debug!("{}", resync);
            self.stats.add_resyncs(resyncs);
        }

        let discarded = now.frames_discarded - self.seen.frames_discarded;
        if discarded > 0 {
            debug!("Discarded {} incomplete frame(s)", discarded);
            self.stats.add_dropped(discarded);
        }

        self.seen = now;
    }
}
