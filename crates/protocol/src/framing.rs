//! Frame codec for length-prefixed framing with optional LZ4 compression.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: payload length (signed 32-bit, little-endian)
//! - N bytes: payload (LZ4 compressed when the connection compresses)
//!
//! A length of zero is a keepalive frame: it carries no payload and never
//! produces a message.
//!
//! # Compression
//!
//! Compression is a connection-wide setting agreed out-of-band. It is not
//! signalled per frame, so both ends must be configured identically. When
//! enabled, every payload is compressed with LZ4 in block format with the
//! uncompressed size prepended.

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload a length prefix can describe.
pub const MAX_PAYLOAD_SIZE: usize = i32::MAX as usize;

/// Size of the uncompressed-length header LZ4 prepends to compressed payloads.
const LZ4_SIZE_HEADER: usize = 4;

/// Upper bound on how far an LZ4 block can expand.
const LZ4_MAX_EXPANSION: usize = 255;

/// Encoder and decoder for frames.
///
/// Encoding is stateless. Length-prefix parsing on the receive side lives in
/// [`FrameReassembler`](crate::reassembler::FrameReassembler); this type only
/// undoes the compression step for a completed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCodec {
    /// Whether payloads are compressed on this connection.
    compress: bool,
    /// Upper bound for decompressed payloads (0 = unlimited).
    max_message_size: usize,
}

impl FrameCodec {
    /// Create a codec with the given compression setting.
    pub fn new(compress: bool) -> Self {
        Self {
            compress,
            max_message_size: 0,
        }
    }

    /// Create a codec that compresses every payload.
    pub fn compressed() -> Self {
        Self::new(true)
    }

    /// Create a codec that sends payloads verbatim.
    pub fn uncompressed() -> Self {
        Self::new(false)
    }

    /// Limit the size a compressed payload may expand to (0 = unlimited).
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Whether this codec compresses payloads.
    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Encode a message into a frame.
    ///
    /// An empty message on an uncompressed connection encodes to the same
    /// bytes as [`keepalive_frame`](Self::keepalive_frame) and is therefore
    /// never delivered as a message.
    pub fn encode(&self, message: &[u8]) -> Result<Vec<u8>> {
        let payload = if self.compress {
            lz4_flex::compress_prepend_size(message)
        } else {
            message.to_vec()
        };

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut output = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        output.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        output.extend_from_slice(&payload);

        Ok(output)
    }

    /// Encode a UTF-8 message into a frame.
    pub fn encode_str(&self, message: &str) -> Result<Vec<u8>> {
        self.encode(message.as_bytes())
    }

    /// The zero-length keepalive frame.
    pub fn keepalive_frame() -> [u8; LENGTH_PREFIX_SIZE] {
        0i32.to_le_bytes()
    }

    /// Undo the compression step for one complete payload.
    ///
    /// Length framing has already been stripped by the reassembler.
    pub fn decode_payload(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if !self.compress {
            return Ok(raw.to_vec());
        }

        if raw.len() < LZ4_SIZE_HEADER {
            return Err(ProtocolError::CorruptPayload(format!(
                "compressed payload too short: {} bytes",
                raw.len()
            )));
        }

        let claimed = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if self.max_message_size > 0 && claimed > self.max_message_size {
            return Err(ProtocolError::CorruptPayload(format!(
                "decompressed size {} exceeds maximum message size {}",
                claimed, self.max_message_size
            )));
        }

        let body = raw.len() - LZ4_SIZE_HEADER;
        if claimed > body.saturating_mul(LZ4_MAX_EXPANSION) {
            return Err(ProtocolError::CorruptPayload(format!(
                "decompressed size {} is impossible for {} compressed bytes",
                claimed, body
            )));
        }

        Ok(lz4_flex::decompress_size_prepended(raw)?)
    }
}

/// Reads a length prefix.
#[inline]
pub(crate) fn read_length_prefix(prefix: [u8; LENGTH_PREFIX_SIZE]) -> i32 {
    i32::from_le_bytes(prefix)
}
