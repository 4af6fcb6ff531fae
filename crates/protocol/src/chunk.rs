//! Wire chunk layout
//!
//! Every chunk starts with the same fixed-size header, all fields big-endian:
//!
//! ```text
//! magic:        u32  (4)  0x5546524D "UFRM"
//! sequence:     u32  (4)  frame sequence number
//! total_len:    u32  (4)  total frame length in bytes
//! offset:       u32  (4)  offset of this payload within the frame
//! payload_len:  u32  (4)  payload bytes following the header
//! payload:      [u8]      payload_len bytes
//! ```
//!
//! A chunk never exceeds the endpoint's maximum packet size, so one chunk is
//! written per bulk transfer.

use crate::error::{ProtocolError, Result};
use crate::frame::SEQUENCE_MODULUS;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Marker opening every chunk header
pub const MAGIC: u32 = 0x5546_524D;

/// Encoded header size on the wire
pub const HEADER_SIZE: usize = 20;

/// Fixed chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sequence: u32,
    pub total_len: u32,
    pub offset: u32,
    pub payload_len: u32,
}

impl ChunkHeader {
    /// Serialize the header (magic included)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        self.put(&mut buf);
        out
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(MAGIC);
        buf.put_u32(self.sequence);
        buf.put_u32(self.total_len);
        buf.put_u32(self.offset);
        buf.put_u32(self.payload_len);
    }

    /// Parse a header from the start of `bytes`
    ///
    /// Only checks the magic marker and length; use [`ChunkHeader::validate`]
    /// for field plausibility.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidHeader {
                reason: format!("bad magic {:#010x}", magic),
            });
        }

        Ok(Self {
            sequence: buf.get_u32(),
            total_len: buf.get_u32(),
            offset: buf.get_u32(),
            payload_len: buf.get_u32(),
        })
    }

    /// Check the header fields against the decoder bounds
    pub fn validate(&self, max_frame_len: usize) -> Result<()> {
        if self.sequence >= SEQUENCE_MODULUS {
            return Err(ProtocolError::InvalidHeader {
                reason: format!("sequence {} out of range", self.sequence),
            });
        }

        if self.total_len as usize > max_frame_len {
            return Err(ProtocolError::InvalidHeader {
                reason: format!(
                    "total length {} exceeds maximum {}",
                    self.total_len, max_frame_len
                ),
            });
        }

        let end = self.offset.checked_add(self.payload_len);
        if end.is_none_or(|end| end > self.total_len) {
            return Err(ProtocolError::InvalidHeader {
                reason: format!(
                    "payload {}+{} overruns frame length {}",
                    self.offset, self.payload_len, self.total_len
                ),
            });
        }

        if self.payload_len == 0 && self.total_len != 0 {
            return Err(ProtocolError::InvalidHeader {
                reason: "empty payload in non-empty frame".to_string(),
            });
        }

        Ok(())
    }
}

/// One wire-sized fragment of an encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

impl WireChunk {
    /// Bytes this chunk occupies on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Header followed by payload, ready for a single bulk write
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
