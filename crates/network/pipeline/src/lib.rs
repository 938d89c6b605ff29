//! Connection message pipeline.
//!
//! Every connection owns one [`MessagePipeline`]: an ordered chain of stages
//! (protocol framing, compression, encryption, flow control, quality) that the
//! handshake assembles before the first application payload may flow.
//!
//! Module map:
//! - message / stage: the unit of data and the stage contract
//! - stages: concrete stage implementations
//! - pipeline: ordered composition, single entry point for send / receive
//! - context: per-connection identity, settings and the stage factory
//! - handshake: poll-based handshakers (trusted + negotiating)
//! - connection / host: lifecycle owner for one or many links
//! - metrics / logging: counters and tracing setup
//!
//! Nothing here performs I/O or blocks; everything is driven from the
//! owner's tick via `update()`.

pub mod connection;
pub mod context;
pub mod error;
pub mod handshake;
pub mod host;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod stage;
pub mod stages;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use context::{DefaultStageFactory, NetworkContext, StageFactory};
pub use error::{AssemblyError, ErrorKind, HandshakeError, NetError, StageFailure};
pub use handshake::{
    HandShaker, HandshakeState, NegotiatingHandShaker, Role, TrivialHandShaker,
};
pub use host::{HandshakeMode, NetworkHost};
pub use message::{Direction, Message};
pub use metrics::NetMetrics;
pub use pipeline::{MessagePipeline, SendOutcome};
pub use stage::{Flow, Stage, StageContext, StageError, StageErrorKind, StageKind, TickContext};
pub use stages::{
    codec::{CodecStage, DeflateCodec, ForwardCodec, PayloadCodec, XChaChaCodec},
    flow_control::{FlowControlStage, FlowState},
    protocol::{PROTOCOL_HEADER_LEN, ProtocolStage},
    quality::{LinkHealth, QUALITY_HEADER_LEN, QualityHandle, QualityMetrics, QualityStage},
};

/// Bytes the steady-state path adds to every payload when compression and
/// encryption are pass-through.
pub const WIRE_OVERHEAD: usize = PROTOCOL_HEADER_LEN + QUALITY_HEADER_LEN;
