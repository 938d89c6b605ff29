//! Frame Codec
//!
//! Responsibilities:
//! - Length-prefix framing: [u32_be length][payload bytes]
//! - (De)serialization of `Frame` (see `frames.rs`) via `bincode`.
//! - Incremental decode support: the handshaker feeds raw packets from the
//!   transport and pulls zero or more frames.
//!
//! Error Handling:
//! - Oversized length prefix (> `max_frame_bytes`) => hard error, the caller
//!   fails the handshake.
//! - Decode errors are returned as `CodecError`; the handshaker translates them
//!   into a `Malformed` failure.
//!
//! Safety / Limits:
//! - `max_frame_bytes` is enforced before allocation for the decode payload.

use thiserror::Error;

use super::frames::Frame;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded frame exceeds max_frame_bytes ({len} > {max})")]
    EncodedTooLarge { len: usize, max: u32 },
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: u32, max: u32 },
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Codec configuration / stateless helper.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum allowed serialized frame payload size (bytes), excluding the 4-byte length prefix.
    pub max_frame_bytes: u32,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self { max_frame_bytes }
    }

    /// Encode a single `Frame` and append to `out`.
    ///
    /// Layout: [len: u32 BE][payload bytes...]
    pub fn encode(&self, frame: &Frame, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let start = out.len();
        out.extend_from_slice(&[0; LENGTH_PREFIX_BYTES]);

        if let Err(e) = bincode::serialize_into(&mut *out, frame) {
            out.truncate(start);
            return Err(e.into());
        }

        let payload_len = out.len() - start - LENGTH_PREFIX_BYTES;
        if payload_len > self.max_frame_bytes as usize {
            // Roll back appended bytes (leave previous data intact)
            out.truncate(start);
            return Err(CodecError::EncodedTooLarge {
                len: payload_len,
                max: self.max_frame_bytes,
            });
        }
        out[start..start + LENGTH_PREFIX_BYTES].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(())
    }

    /// Encode a single frame into a fresh buffer.
    pub fn encode_to_vec(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode(frame, &mut out)?;
        Ok(out)
    }

    /// Attempt to decode exactly one frame from `buffer`.
    ///
    /// Returns:
    /// - Ok(Some(Frame)) if a full frame was decoded (and removed from buffer)
    /// - Ok(None) if not enough data yet
    /// - Err if malformed / violates size limit / decode error
    ///
    /// The buffer may contain additional bytes (subsequent frames) which remain untouched.
    pub fn try_decode(buffer: &mut Vec<u8>, max_frame_bytes: u32) -> Result<Option<Frame>, CodecError> {
        if buffer.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
        len_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_BYTES]);
        let frame_len = u32::from_be_bytes(len_bytes);

        if frame_len > max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                len: frame_len,
                max: max_frame_bytes,
            });
        }

        let total_needed = LENGTH_PREFIX_BYTES + frame_len as usize;
        if buffer.len() < total_needed {
            return Ok(None);
        }

        let decoded = bincode::deserialize::<Frame>(&buffer[LENGTH_PREFIX_BYTES..total_needed]);
        // Drain consumed bytes even on failure; the stream is unusable afterwards anyway.
        buffer.drain(..total_needed);
        Ok(Some(decoded?))
    }
}

/// Stateful incremental decoder.
/// Feed arbitrary chunks via `push_bytes`, then repeatedly call `next_frame`
/// until it returns Ok(None).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Supply additional raw bytes.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempt to pull one frame. See `FrameCodec::try_decode` semantics.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        FrameCodec::try_decode(&mut self.buf, self.max_frame_bytes)
    }

    /// Expose internal buffered (undecoded) byte count (for diagnostics).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Hand out whatever was buffered but not consumed as a frame.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Clear buffer (e.g. after fatal error).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.shrink_to_fit();
    }
}
