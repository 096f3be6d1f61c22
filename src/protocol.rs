//! Frame codec for the length-prefixed echo protocol.
//!
//! Every message on the wire is a fixed 12-byte header followed by the
//! payload. All header fields are big-endian regardless of host byte order.
//!
//! ```text
//! offset 0:  magic          u32   MAGIC
//! offset 4:  payload_length u32   1..=max_payload
//! offset 8:  message_id     u32   echoed unchanged
//! offset 12: payload        payload_length bytes
//! ```
//!
//! The codec is a pure transform; it never touches a socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sentinel identifying a valid frame (ASCII `"ECHO"`).
pub const MAGIC: u32 = 0x4543_484F;

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 12;

/// Default upper bound on `payload_length`.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// Byte the load client fills payloads with.
pub const PAYLOAD_PATTERN: u8 = b'a';

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub payload_length: u32,
    pub message_id: u32,
}

/// Frame validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Header carried something other than [`MAGIC`].
    InvalidMagic(u32),
    /// Declared payload length outside `1..=max`.
    InvalidLength { length: u32, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidMagic(found) => {
                write!(f, "invalid magic 0x{found:08X} (expected 0x{MAGIC:08X})")
            }
            FrameError::InvalidLength { length, max } => {
                write!(f, "invalid payload length {length} (allowed 1..={max})")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameHeader {
    /// Build a header carrying the protocol magic.
    pub fn new(payload_length: u32, message_id: u32) -> Self {
        Self {
            magic: MAGIC,
            payload_length,
            message_id,
        }
    }

    /// Append the big-endian encoding to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.magic);
        dst.put_u32(self.payload_length);
        dst.put_u32(self.message_id);
    }

    /// Encode into a fixed header slot.
    pub fn encode_into(&self, dst: &mut [u8; HEADER_LEN]) {
        let mut slot = &mut dst[..];
        self.encode(&mut slot);
    }

    /// Decode a header, rejecting a wrong magic.
    ///
    /// The length is not checked here; see [`FrameHeader::validate`].
    pub fn decode(src: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let mut buf = &src[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            payload_length: buf.get_u32(),
            message_id: buf.get_u32(),
        })
    }

    /// Check the declared payload length against `1..=max_payload`.
    ///
    /// Returns the length as `usize` on success. Zero-length payloads are
    /// rejected.
    pub fn validate(&self, max_payload: usize) -> Result<usize, FrameError> {
        let length = self.payload_length as usize;
        if length == 0 || length > max_payload {
            return Err(FrameError::InvalidLength {
                length: self.payload_length,
                max: max_payload,
            });
        }
        Ok(length)
    }
}

/// Encode a complete frame (header followed by payload).
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}
