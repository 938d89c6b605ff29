//! Compression and encryption stages.
//!
//! Both stages share one shape: a [`CodecStage`] wrapping a [`PayloadCodec`].
//! The codec only sees byte slices; buffer handling (pool acquisition,
//! release on success and on failure) lives in the stage.
//!
//! Codecs:
//! - [`ForwardCodec`]: pass-through, zero copies, never fails
//! - [`DeflateCodec`]: DEFLATE via `flate2`, small payloads stored as-is
//! - [`XChaChaCodec`]: XChaCha20-Poly1305 with a random 24-byte nonce per message

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use network_shared::{
    BufferPool, NetworkSettings,
    messaging::frames::{CompressionKind, EncryptionKind},
};
use rand::RngCore;
use tracing::trace;

use crate::{
    error::AssemblyError,
    message::{Direction, Message},
    stage::{Flow, Stage, StageContext, StageError, StageKind},
    stages::protocol::PROTOCOL_HEADER_LEN,
};

/// Reversible payload transform.
///
/// Law: for every payload `p` the codec accepts, `unwrap(wrap(p)) == p`.
pub trait PayloadCodec: Send {
    fn name(&self) -> &'static str;

    /// Identity codecs let the stage skip the copy entirely.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Capacity hint for the output buffer of `wrap`.
    fn wrapped_capacity(&self, len: usize) -> usize {
        len
    }

    fn wrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError>;

    fn unwrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError>;
}

/// Pass-through codec, used until a handshake negotiates something else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardCodec;

impl PayloadCodec for ForwardCodec {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn wrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }

    fn unwrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        out.extend_from_slice(input);
        Ok(())
    }
}

const MARKER_STORED: u8 = 0;
const MARKER_DEFLATED: u8 = 1;

/// DEFLATE codec.
///
/// Wire format: `[0][raw bytes]` or `[1][original length: u32 BE][deflate stream]`.
/// Payloads below `min_size`, and payloads that do not shrink, are stored.
#[derive(Debug, Clone)]
pub struct DeflateCodec {
    level: Compression,
    min_size: usize,
    max_size: usize,
}

impl DeflateCodec {
    pub fn new(level: u32, min_size: usize, max_size: usize) -> Self {
        Self {
            level: Compression::new(level),
            min_size,
            max_size,
        }
    }

    fn store(input: &[u8], out: &mut BytesMut) {
        out.clear();
        out.put_u8(MARKER_STORED);
        out.extend_from_slice(input);
    }
}

impl PayloadCodec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn wrapped_capacity(&self, len: usize) -> usize {
        len + 5
    }

    fn wrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        if input.len() > self.max_size {
            return Err(StageError::encode(format!(
                "payload of {} bytes exceeds compression limit {}",
                input.len(),
                self.max_size
            )));
        }
        if input.len() < self.min_size {
            Self::store(input, out);
            return Ok(());
        }

        out.put_u8(MARKER_DEFLATED);
        out.put_u32(input.len() as u32);
        let mut encoder = DeflateEncoder::new((&mut *out).writer(), self.level);
        encoder
            .write_all(input)
            .map_err(|e| StageError::encode(format!("deflate: {e}")))?;
        encoder
            .finish()
            .map_err(|e| StageError::encode(format!("deflate: {e}")))?;

        if out.len() > input.len() {
            Self::store(input, out);
        }
        Ok(())
    }

    fn unwrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        let Some((&marker, mut body)) = input.split_first() else {
            return Err(StageError::decode("empty compressed payload"));
        };
        match marker {
            MARKER_STORED => {
                if body.len() > self.max_size {
                    return Err(StageError::decode("stored payload exceeds compression limit"));
                }
                out.extend_from_slice(body);
                Ok(())
            }
            MARKER_DEFLATED => {
                if body.len() < 4 {
                    return Err(StageError::decode("deflated payload misses length"));
                }
                let declared = body.get_u32() as usize;
                if declared > self.max_size {
                    return Err(StageError::decode(format!(
                        "declared length {declared} exceeds compression limit {}",
                        self.max_size
                    )));
                }
                // Read at most one byte past the declared length to detect overruns.
                let mut decoder = DeflateDecoder::new(body).take(declared as u64 + 1);
                let mut writer = (&mut *out).writer();
                std::io::copy(&mut decoder, &mut writer)
                    .map_err(|e| StageError::decode(format!("inflate: {e}")))?;
                if out.len() != declared {
                    return Err(StageError::decode(format!(
                        "inflated {} bytes, header declared {declared}",
                        out.len()
                    )));
                }
                Ok(())
            }
            other => Err(StageError::decode(format!("unknown compression marker {other}"))),
        }
    }
}

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 codec.
///
/// Wire format: `[nonce: 24][ciphertext][tag: 16]`.
pub struct XChaChaCodec {
    cipher: XChaCha20Poly1305,
    sealed: u64,
    max_messages: u64,
}

impl XChaChaCodec {
    pub fn new(key: &[u8; 32], max_messages: u64) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
            sealed: 0,
            max_messages,
        }
    }

    /// Messages sealed under the current key.
    pub fn sealed(&self) -> u64 {
        self.sealed
    }
}

impl PayloadCodec for XChaChaCodec {
    fn name(&self) -> &'static str {
        "xchacha20poly1305"
    }

    fn wrapped_capacity(&self, len: usize) -> usize {
        len + NONCE_LEN + TAG_LEN
    }

    fn wrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        if self.sealed >= self.max_messages {
            return Err(StageError::encode(format!(
                "key exhausted after {} messages",
                self.sealed
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), input)
            .map_err(|_| StageError::encode("seal failed"))?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        self.sealed += 1;
        Ok(())
    }

    fn unwrap(&mut self, input: &[u8], out: &mut BytesMut) -> Result<(), StageError> {
        if input.len() < NONCE_LEN + TAG_LEN {
            return Err(StageError::decode(format!(
                "ciphertext of {} bytes too short",
                input.len()
            )));
        }
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(&input[..NONCE_LEN]), &input[NONCE_LEN..])
            .map_err(|_| StageError::decode("authentication failed"))?;
        out.extend_from_slice(&opened);
        Ok(())
    }
}

/// Compression or encryption stage around a codec.
pub struct CodecStage {
    kind: StageKind,
    name: String,
    codec: Box<dyn PayloadCodec>,
}

impl CodecStage {
    pub fn new(kind: StageKind, codec: Box<dyn PayloadCodec>) -> Self {
        Self {
            name: format!("{}:{}", kind.label(), codec.name()),
            kind,
            codec,
        }
    }

    pub fn forward(kind: StageKind) -> Self {
        Self::new(kind, Box::new(ForwardCodec))
    }

    /// Compression stage for a negotiated codec.
    pub fn compression(kind: CompressionKind, settings: &NetworkSettings) -> Result<Self, AssemblyError> {
        let codec: Box<dyn PayloadCodec> = match kind {
            CompressionKind::None => Box::new(ForwardCodec),
            CompressionKind::Deflate => Box::new(DeflateCodec::new(
                settings.compression.level,
                settings.compression.min_size,
                settings.protocol.max_payload_bytes as usize + PROTOCOL_HEADER_LEN,
            )),
        };
        Ok(Self::new(StageKind::Compression, codec))
    }

    /// Encryption stage for a negotiated codec. Real ciphers need the
    /// configured pre-shared key.
    pub fn encryption(kind: EncryptionKind, settings: &NetworkSettings) -> Result<Self, AssemblyError> {
        let codec: Box<dyn PayloadCodec> = match kind {
            EncryptionKind::None => Box::new(ForwardCodec),
            EncryptionKind::XChaCha20Poly1305 => {
                let key = settings
                    .encryption
                    .key_bytes()?
                    .ok_or(AssemblyError::MissingKey { codec: kind.label() })?;
                Box::new(XChaChaCodec::new(
                    &key,
                    settings.encryption.max_messages_per_key,
                ))
            }
        };
        Ok(Self::new(StageKind::Encryption, codec))
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    fn transform(
        &mut self,
        mut msg: Message,
        pool: &mut BufferPool,
        direction: Direction,
    ) -> Result<Message, StageError> {
        if self.codec.is_passthrough() {
            return Ok(msg);
        }
        let mut out = match direction {
            Direction::Outgoing => pool.acquire(self.codec.wrapped_capacity(msg.size())),
            Direction::Incoming => pool.acquire(msg.size()),
        };
        let result = match direction {
            Direction::Outgoing => self.codec.wrap(msg.payload(), &mut out),
            Direction::Incoming => self.codec.unwrap(msg.payload(), &mut out),
        };
        match result {
            Ok(()) => {
                trace!(
                    target: "net::pipeline",
                    stage = %self.name,
                    %direction,
                    before = msg.size(),
                    after = out.len(),
                    "codec applied"
                );
                let old = msg.replace_payload(out);
                pool.release(old);
                Ok(msg)
            }
            Err(err) => {
                pool.release(out);
                pool.release(msg.into_payload());
                Err(err)
            }
        }
    }
}

impl Stage for CodecStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn outgoing(&mut self, msg: Message, cx: &mut StageContext<'_>) -> Result<Flow, StageError> {
        self.transform(msg, cx.pool, Direction::Outgoing).map(Flow::Forward)
    }

    fn incoming(&mut self, msg: Message, cx: &mut StageContext<'_>) -> Result<Message, StageError> {
        self.transform(msg, cx.pool, Direction::Incoming)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use network_shared::ConnectionId;

    use super::*;
    use crate::stage::StageErrorKind;

    fn roundtrip(codec: &mut dyn PayloadCodec, payload: &[u8]) -> Vec<u8> {
        let mut wrapped = BytesMut::new();
        codec.wrap(payload, &mut wrapped).unwrap();
        let mut unwrapped = BytesMut::new();
        codec.unwrap(&wrapped, &mut unwrapped).unwrap();
        unwrapped.to_vec()
    }

    fn sample_payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            b"x".to_vec(),
            b"the quick brown fox ".repeat(200),
            (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect(),
        ]
    }

    #[test]
    fn roundtrip_law_holds_for_all_codecs() {
        let mut codecs: Vec<Box<dyn PayloadCodec>> = vec![
            Box::new(ForwardCodec),
            Box::new(DeflateCodec::new(6, 16, 64 * 1024)),
            Box::new(XChaChaCodec::new(&[7; 32], 1_000)),
        ];
        for codec in codecs.iter_mut() {
            for payload in sample_payloads() {
                assert_eq!(roundtrip(codec.as_mut(), &payload), payload, "{}", codec.name());
            }
        }
    }

    #[test]
    fn deflate_shrinks_repetitive_payloads_and_stores_small_ones() {
        let mut codec = DeflateCodec::new(6, 128, 64 * 1024);
        let mut out = BytesMut::new();
        codec.wrap(&b"abcd".repeat(500), &mut out).unwrap();
        assert_eq!(out[0], MARKER_DEFLATED);
        assert!(out.len() < 200);

        let mut small = BytesMut::new();
        codec.wrap(b"tiny", &mut small).unwrap();
        assert_eq!(&small[..], b"\0tiny");
    }

    #[test]
    fn deflate_enforces_limits() {
        let mut codec = DeflateCodec::new(6, 0, 32);
        let err = codec.wrap(&[0; 33], &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::EncodeError);

        // A peer with a larger limit produces a frame this side refuses to inflate.
        let mut generous = DeflateCodec::new(6, 0, 4096);
        let mut wrapped = BytesMut::new();
        generous.wrap(&[0; 4096], &mut wrapped).unwrap();
        let err = codec.unwrap(&wrapped, &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::DecodeError);
    }

    #[test]
    fn deflate_rejects_malformed_input() {
        let mut codec = DeflateCodec::new(6, 0, 4096);
        for bad in [
            &[][..],
            &[9, 1, 2][..],
            &[MARKER_DEFLATED, 0, 0][..],
            &[MARKER_DEFLATED, 0, 0, 0, 16, 0xFF, 0xFF, 0xFF][..],
        ] {
            let err = codec.unwrap(bad, &mut BytesMut::new()).unwrap_err();
            assert_eq!(err.kind, StageErrorKind::DecodeError, "{bad:?}");
        }

        let mut wrapped = BytesMut::new();
        codec.wrap(&b"hello world ".repeat(100), &mut wrapped).unwrap();
        let truncated = &wrapped[..wrapped.len() / 2];
        assert!(codec.unwrap(truncated, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn xchacha_detects_tampering_and_short_input() {
        let mut codec = XChaChaCodec::new(&[1; 32], 10);
        let mut wrapped = BytesMut::new();
        codec.wrap(b"secret", &mut wrapped).unwrap();
        assert_eq!(wrapped.len(), 6 + NONCE_LEN + TAG_LEN);

        let mut tampered = wrapped.clone();
        tampered[NONCE_LEN] ^= 0x01;
        let err = codec.unwrap(&tampered, &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::DecodeError);

        let err = codec.unwrap(&wrapped[..20], &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::DecodeError);

        let mut other_key = XChaChaCodec::new(&[2; 32], 10);
        assert!(other_key.unwrap(&wrapped, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn xchacha_nonces_differ_per_message() {
        let mut codec = XChaChaCodec::new(&[1; 32], 10);
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        codec.wrap(b"same", &mut a).unwrap();
        codec.wrap(b"same", &mut b).unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.sealed(), 2);
    }

    #[test]
    fn xchacha_key_exhaustion_is_encode_error() {
        let mut codec = XChaChaCodec::new(&[1; 32], 2);
        codec.wrap(b"1", &mut BytesMut::new()).unwrap();
        codec.wrap(b"2", &mut BytesMut::new()).unwrap();
        let err = codec.wrap(b"3", &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind, StageErrorKind::EncodeError);
        assert!(err.detail.contains("exhausted"));
    }

    #[test]
    fn forward_stage_keeps_the_same_buffer() {
        let mut pool = BufferPool::default();
        let mut stage = CodecStage::forward(StageKind::Compression);
        assert_eq!(stage.name(), "compression:forward");

        let payload = BytesMut::from(&b"zero copy"[..]);
        let ptr = payload.as_ptr();
        let mut cx = StageContext {
            connection_id: ConnectionId::new(1),
            now: Instant::now(),
            pool: &mut pool,
        };
        let msg = Message::new(1, Direction::Outgoing, payload);
        let Flow::Forward(msg) = stage.outgoing(msg, &mut cx).unwrap() else {
            panic!("forward stage must forward");
        };
        assert_eq!(msg.payload().as_ptr(), ptr);
        assert_eq!(pool.stats().misses, 0);
    }

    #[test]
    fn failed_transform_returns_buffers_to_pool() {
        let mut pool = BufferPool::default();
        let mut stage = CodecStage::new(StageKind::Encryption, Box::new(XChaChaCodec::new(&[3; 32], 8)));
        let mut cx = StageContext {
            connection_id: ConnectionId::new(1),
            now: Instant::now(),
            pool: &mut pool,
        };
        let mut junk = BytesMut::with_capacity(256);
        junk.extend_from_slice(&[0xAB; 64]);
        let err = stage
            .incoming(Message::new(0, Direction::Incoming, junk), &mut cx)
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::DecodeError);
        assert_eq!(pool.stats().retained, 2);
    }

    #[test]
    fn encryption_without_key_fails_assembly() {
        let settings = NetworkSettings::default();
        let err = CodecStage::encryption(EncryptionKind::XChaCha20Poly1305, &settings)
            .err()
            .expect("missing key");
        assert_eq!(err, AssemblyError::MissingKey { codec: "xchacha20poly1305" });

        let mut keyed = NetworkSettings::default();
        keyed.encryption.pre_shared_key = Some("ab".repeat(32));
        let stage = CodecStage::encryption(EncryptionKind::XChaCha20Poly1305, &keyed).unwrap();
        assert_eq!(stage.name(), "encryption:xchacha20poly1305");
    }
}
