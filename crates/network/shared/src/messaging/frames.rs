//! Handshake Frame Definitions
//!
//! Scope:
//! - Frames exchanged on the raw transport *before* a pipeline exists.
//! - Negotiation (ClientHello / ServerHello) + failure reporting (HandshakeError).
//!
//! Encoding / Framing:
//! - These logical frames are wrapped by a length-prefix + bincode codec (see `codec.rs`).
//! - Once a pipeline is assembled no frame from this module travels on the link again.
//!
//! Versioning Strategy:
//! - `ClientHello.version` is compared against `SUPPORTED_VERSIONS` by the responder.
//! - New variants are appended at the end only, so older peers keep decoding the
//!   variants they know.

use serde::{Deserialize, Serialize};

/// Compression codecs a peer can offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    /// Pass-through.
    None,
    Deflate,
}

impl CompressionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Deflate => "deflate",
        }
    }
}

/// Encryption codecs a peer can offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EncryptionKind {
    /// Pass-through.
    #[serde(rename = "none")]
    None,
    #[serde(rename = "xchacha20poly1305")]
    XChaCha20Poly1305,
}

impl EncryptionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::XChaCha20Poly1305 => "xchacha20poly1305",
        }
    }
}

/// Error categories for the handshake phase.
/// Keep codes stable for peer-side mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeErrorCode {
    UnsupportedVersion = 1,
    Malformed = 4,
    Internal = 5,
    Timeout = 6,
    NoCommonCodec = 7,
}

impl HandshakeErrorCode {
    /// Human readable short label (stable).
    pub fn label(self) -> &'static str {
        match self {
            Self::UnsupportedVersion => "unsupported_version",
            Self::Malformed => "malformed",
            Self::Internal => "internal",
            Self::Timeout => "timeout",
            Self::NoCommonCodec => "no_common_codec",
        }
    }
}

/// Frames exchanged strictly before pipeline assembly (and for reporting failures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeFrame {
    /// First packet from the initiator.
    ClientHello {
        /// Protocol version the initiator speaks.
        version: u16,
        /// Offered compression codecs, most preferred first.
        compression: Vec<CompressionKind>,
        /// Offered encryption codecs, most preferred first.
        encryption: Vec<EncryptionKind>,
    },
    /// Positive responder answer after validating `ClientHello`.
    ServerHello {
        accepted_version: u16,
        compression: CompressionKind,
        encryption: EncryptionKind,
    },
    /// Terminal handshake failure – the sender tears the link down afterwards.
    HandshakeError {
        code: HandshakeErrorCode,
        /// Short textual diagnostic (NOT intended for end-users).
        message: String,
    },
}

/// Envelope for all raw-link frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Handshake(HandshakeFrame),
}

impl Frame {
    /// Returns true if this frame is a handshake initiation.
    pub fn is_client_hello(&self) -> bool {
        matches!(self, Frame::Handshake(HandshakeFrame::ClientHello { .. }))
    }

    /// Convenience constructor for a handshake error frame.
    pub fn handshake_error(code: HandshakeErrorCode, msg: impl Into<String>) -> Self {
        Frame::Handshake(HandshakeFrame::HandshakeError {
            code,
            message: msg.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_helper() {
        let f = Frame::handshake_error(HandshakeErrorCode::Malformed, "bad");
        let bin = bincode::serialize(&f).unwrap();
        let de: Frame = bincode::deserialize(&bin).unwrap();
        match de {
            Frame::Handshake(HandshakeFrame::HandshakeError { code, message }) => {
                assert_eq!(code, HandshakeErrorCode::Malformed);
                assert_eq!(message, "bad");
            }
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn client_hello_detection() {
        let hello = Frame::Handshake(HandshakeFrame::ClientHello {
            version: 1,
            compression: vec![CompressionKind::Deflate, CompressionKind::None],
            encryption: vec![EncryptionKind::None],
        });
        assert!(hello.is_client_hello());
        assert!(!Frame::handshake_error(HandshakeErrorCode::Timeout, "t").is_client_hello());
    }

    #[test]
    fn labels_unique() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        for c in [
            HandshakeErrorCode::UnsupportedVersion,
            HandshakeErrorCode::Malformed,
            HandshakeErrorCode::Internal,
            HandshakeErrorCode::Timeout,
            HandshakeErrorCode::NoCommonCodec,
        ] {
            assert!(set.insert(c.label()), "duplicate label {}", c.label());
        }
    }
}
