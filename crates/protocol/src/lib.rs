//! Wire protocol for usb-frame-link
//!
//! This crate defines how variable-length frames travel over a USB bulk link
//! whose transfers are capped at the endpoint's maximum packet size. Frames are
//! split into self-describing chunks with a fixed 20-byte header, and the
//! receiving side reassembles them, resynchronizing on the header magic when a
//! chunk is lost or garbled. It also carries the device and endpoint data model
//! shared by the rest of the workspace. Nothing in here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{Frame, FrameDecoder, DecodeLimits, encode};
//!
//! let frame = Frame::new(7, vec![0xAB; 1100]);
//!
//! // Split into chunks that fit a 512-byte bulk packet
//! let chunks = encode(&frame, 512).unwrap();
//! assert_eq!(chunks.len(), 3);
//!
//! // Feed the wire bytes back through a decoder
//! let mut decoder = FrameDecoder::new(DecodeLimits::default());
//! let mut frames = Vec::new();
//! for chunk in &chunks {
//!     frames.extend(decoder.push(&chunk.to_bytes()));
//! }
//! assert_eq!(frames, vec![frame]);
//! ```

pub mod chunk;
pub mod codec;
pub mod error;
pub mod frame;
pub mod types;

pub use chunk::{ChunkHeader, HEADER_SIZE, MAGIC, WireChunk};
pub use codec::{
    Decode, DecodeLimits, DecoderStats, FrameDecoder, decode, encode, max_chunk_payload,
};
pub use error::{ProtocolError, Result};
pub use frame::{Frame, MAX_FRAME_LEN, SEQUENCE_MODULUS, SequenceCounter};
pub use types::{DeviceDescriptor, DeviceId, Direction, EndpointDescriptor, TransferKind};
