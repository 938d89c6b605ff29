//! Shared networking types for the connection pipeline.
//!
//! This crate hosts the primitives both handshake roles and the pipeline
//! crate agree on:
//! - transport: the `Transporter` contract + an in-memory loopback implementation
//! - messaging: handshake frames and the length-prefixed frame codec
//! - config: `NetworkSettings` (serde / TOML)
//! - pool: size-class buffer pool for message payloads
//! - ids / clock: connection identifiers and an injectable time source
//!
//! Keep this crate lean: no stage logic lives here.

pub mod clock;
pub mod config;
pub mod events;
pub mod ids;
pub mod messaging;
pub mod pool;
pub mod transport;

/// Supported protocol versions (handshake negotiation baseline).
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

/// Protocol version spoken by this build when it initiates a handshake.
pub const PROTOCOL_VERSION: u16 = 1;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{NetworkSettings, SettingsError};
pub use events::{CloseReason, LinkStats, TransportCapabilities, TransportError};
pub use ids::{ConnectionId, IdGenerator};
pub use pool::{BufferPool, PoolStats};
pub use transport::{Transporter, TransporterState};

/// Convenience prelude for downstream crates.
pub mod prelude {
    pub use crate::messaging::codec::{FrameCodec, FrameDecoder};
    pub use crate::messaging::frames::{
        CompressionKind, EncryptionKind, Frame, HandshakeErrorCode, HandshakeFrame,
    };
    pub use crate::transport::loopback::{LoopbackPair, LoopbackTransporter};
    pub use crate::{
        Clock, CloseReason, ConnectionId, LinkStats, ManualClock, NetworkSettings,
        SUPPORTED_VERSIONS, SharedClock, SystemClock, TransportError, Transporter,
        TransporterState,
    };
}
