//! Frame chunking and reassembly
//!
//! [`encode`] splits a frame into [`WireChunk`]s no larger than a bulk packet.
//! [`FrameDecoder`] consumes received buffers, each holding zero or more whole
//! chunks, and yields frames once every byte has arrived.
//!
//! # Resynchronization
//!
//! A buffer position that does not hold a plausible header is treated as loss
//! of sync: the decoder skips forward to the next magic marker, counts a
//! resync and carries on. Resyncs are never fatal.
//!
//! # Reassembly
//!
//! Only one frame is reassembled at a time. Chunks of that frame must arrive
//! in offset order since the bulk transport preserves order; a gap abandons
//! the frame. A chunk carrying a different sequence number discards the
//! partial frame before starting the new one.

use crate::chunk::{ChunkHeader, HEADER_SIZE, MAGIC, WireChunk};
use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, MAX_FRAME_LEN};
use bytes::BytesMut;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Largest payload a chunk can carry for the given packet size
pub fn max_chunk_payload(max_packet: usize) -> Result<usize> {
    if max_packet <= HEADER_SIZE {
        return Err(ProtocolError::PacketTooSmall {
            packet: max_packet,
            min: HEADER_SIZE + 1,
        });
    }
    Ok(max_packet - HEADER_SIZE)
}

/// Split a frame into chunks of at most `max_packet` bytes each
///
/// The last chunk carries the remainder (or a full payload when the length
/// divides evenly); no terminator chunk is emitted because every header
/// carries the total length. An empty frame becomes one header-only chunk.
///
/// # Example
/// ```
/// use protocol::{Frame, encode};
///
/// let chunks = encode(&Frame::new(0, vec![0u8; 1100]), 512).unwrap();
/// let sizes: Vec<usize> = chunks.iter().map(|c| c.payload.len()).collect();
/// assert_eq!(sizes, vec![492, 492, 116]);
/// ```
pub fn encode(frame: &Frame, max_packet: usize) -> Result<Vec<WireChunk>> {
    let payload_max = max_chunk_payload(max_packet)?;

    if frame.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let total_len = frame.len() as u32;
    let data = frame.data();

    if data.is_empty() {
        return Ok(vec![WireChunk {
            header: ChunkHeader {
                sequence: frame.sequence(),
                total_len: 0,
                offset: 0,
                payload_len: 0,
            },
            payload: data.clone(),
        }]);
    }

    let chunks = (0..data.len())
        .step_by(payload_max)
        .map(|offset| {
            let end = (offset + payload_max).min(data.len());
            WireChunk {
                header: ChunkHeader {
                    sequence: frame.sequence(),
                    total_len,
                    offset: offset as u32,
                    payload_len: (end - offset) as u32,
                },
                payload: data.slice(offset..end),
            }
        })
        .collect();

    Ok(chunks)
}

/// Plausibility bounds applied to every received header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Largest total frame length accepted
    pub max_frame_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Counters describing what the decoder has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames delivered complete
    pub frames_completed: u64,
    /// Partial frames dropped (superseded or gapped)
    pub frames_discarded: u64,
    /// Times the decoder lost sync and skipped to the next magic marker
    pub resyncs: u64,
    /// Bytes skipped while resynchronizing
    pub bytes_skipped: u64,
    /// Chunks that joined a frame mid-way and could not be used
    pub orphan_chunks: u64,
}

/// In-flight frame being reassembled
#[derive(Debug)]
struct ReassemblyBuffer {
    sequence: u32,
    total_len: usize,
    data: BytesMut,
}

impl ReassemblyBuffer {
    fn new(header: &ChunkHeader) -> Self {
        Self {
            sequence: header.sequence,
            total_len: header.total_len as usize,
            data: BytesMut::with_capacity(header.total_len as usize),
        }
    }

    fn received(&self) -> usize {
        self.data.len()
    }

    fn is_complete(&self) -> bool {
        self.received() == self.total_len
    }
}

/// Incremental chunk decoder
#[derive(Debug)]
pub struct FrameDecoder {
    limits: DecodeLimits,
    partial: Option<ReassemblyBuffer>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            limits,
            partial: None,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Sequence number of the frame currently being reassembled, if any
    pub fn pending_sequence(&self) -> Option<u32> {
        self.partial.as_ref().map(|p| p.sequence)
    }

    /// Feed one received buffer and collect the frames it completes
    pub fn push(&mut self, buf: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let rest = &buf[pos..];

            match self.chunk_at(rest) {
                Ok((header, chunk_len)) => {
                    let payload = &rest[HEADER_SIZE..chunk_len];
                    if let Some(frame) = self.route(&header, payload) {
                        frames.push(frame);
                    }
                    pos += chunk_len;
                }
                Err(e) => {
                    let skip = find_magic(&rest[1..]).map_or(rest.len(), |i| i + 1);
                    self.stats.resyncs += 1;
                    self.stats.bytes_skipped += skip as u64;
                    warn!("Chunk stream lost sync ({}), skipping {} bytes", e, skip);
                    pos += skip;
                }
            }
        }

        frames
    }

    /// Parse and validate the chunk starting at `rest`, returning its wire length
    fn chunk_at(&self, rest: &[u8]) -> Result<(ChunkHeader, usize)> {
        let header = ChunkHeader::parse(rest)?;
        header.validate(self.limits.max_frame_len)?;

        let chunk_len = HEADER_SIZE + header.payload_len as usize;
        if rest.len() < chunk_len {
            return Err(ProtocolError::BufferTooSmall {
                needed: chunk_len,
                available: rest.len(),
            });
        }

        Ok((header, chunk_len))
    }

    fn route(&mut self, header: &ChunkHeader, payload: &[u8]) -> Option<Frame> {
        // A chunk at offset 0 always starts a frame, even under the same sequence
        if let Some(prior) = self
            .partial
            .take_if(|p| p.sequence != header.sequence || header.offset == 0)
        {
            self.stats.frames_discarded += 1;
            warn!(
                "Frame {} superseded by {} after {}/{} bytes",
                prior.sequence,
                header.sequence,
                prior.received(),
                prior.total_len
            );
        }

        if self.partial.is_none() {
            if header.offset != 0 {
                self.stats.orphan_chunks += 1;
                debug!(
                    "Dropping chunk of frame {} at offset {} with no frame start",
                    header.sequence, header.offset
                );
                return None;
            }
            self.partial = Some(ReassemblyBuffer::new(header));
        }

        let partial = self.partial.as_mut()?;
        if header.total_len as usize != partial.total_len
            || header.offset as usize != partial.received()
        {
            self.stats.frames_discarded += 1;
            warn!(
                "Frame {} abandoned: chunk at offset {} (expected {}), total {} (expected {})",
                header.sequence,
                header.offset,
                partial.received(),
                header.total_len,
                partial.total_len
            );
            self.partial = None;
            return None;
        }

        partial.data.extend_from_slice(payload);
        if !partial.is_complete() {
            return None;
        }

        let done = self.partial.take()?;
        self.stats.frames_completed += 1;
        debug!("Frame {} complete ({} bytes)", done.sequence, done.total_len);
        Some(Frame::new(done.sequence, done.data.freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DecodeLimits::default())
    }
}

fn find_magic(bytes: &[u8]) -> Option<usize> {
    let marker = MAGIC.to_be_bytes();
    bytes.windows(marker.len()).position(|w| w == marker)
}

/// Lazily decode a sequence of received buffers into complete frames
///
/// # Example
/// ```
/// use protocol::{DecodeLimits, Frame, decode, encode};
///
/// let frame = Frame::new(1, vec![7u8; 3000]);
/// let buffers: Vec<_> = encode(&frame, 512)
///     .unwrap()
///     .iter()
///     .map(|c| c.to_bytes())
///     .collect();
///
/// let frames: Vec<Frame> = decode(buffers, DecodeLimits::default()).collect();
/// assert_eq!(frames, vec![frame]);
/// ```
pub fn decode<I>(buffers: I, limits: DecodeLimits) -> Decode<I::IntoIter>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    Decode {
        buffers: buffers.into_iter(),
        decoder: FrameDecoder::new(limits),
        ready: VecDeque::new(),
    }
}

/// Iterator returned by [`decode`]
#[derive(Debug)]
pub struct Decode<I> {
    buffers: I,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
}

impl<I> Decode<I> {
    pub fn stats(&self) -> DecoderStats {
        self.decoder.stats()
    }
}

impl<I> Iterator for Decode<I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(frame);
            }
            let buf = self.buffers.next()?;
            self.ready.extend(self.decoder.push(buf.as_ref()));
        }
    }
}
