//! Frames and their sequence numbers

use bytes::Bytes;

/// Sequence numbers wrap at 2^31; a header carrying a larger value is implausible
pub const SEQUENCE_MODULUS: u32 = 1 << 31;

/// Hard upper bound on a frame's total length (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// An opaque frame payload plus its sequence number
///
/// The sequence number only serves diagnostics and supersession checks. The
/// bulk transport preserves order, so frames are never reordered by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u32,
    data: Bytes,
}

impl Frame {
    /// Create a frame; the sequence number is reduced modulo [`SEQUENCE_MODULUS`]
    pub fn new(sequence: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sequence: sequence % SEQUENCE_MODULUS,
            data: data.into(),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// Monotonic sequence source for producers
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an arbitrary value (reduced modulo [`SEQUENCE_MODULUS`])
    pub fn starting_at(value: u32) -> Self {
        Self {
            next: value % SEQUENCE_MODULUS,
        }
    }

    /// Return the next sequence number and advance, wrapping at the modulus
    pub fn next_sequence(&mut self) -> u32 {
        let current = self.next;
        self.next = (self.next + 1) % SEQUENCE_MODULUS;
        current
    }

    /// Stamp a payload with the next sequence number
    pub fn frame(&mut self, data: impl Into<Bytes>) -> Frame {
        Frame::new(self.next_sequence(), data)
    }
}
