//! Raw-link messaging used before a pipeline exists.

pub mod codec;
pub mod frames;

pub use codec::{CodecError, FrameCodec, FrameDecoder};
pub use frames::{CompressionKind, EncryptionKind, Frame, HandshakeErrorCode, HandshakeFrame};
