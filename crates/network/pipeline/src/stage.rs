//! Stage contract.
//!
//! A stage transforms messages in both directions. Stages live in one
//! ordered list inside the pipeline; outgoing traffic walks the list front to
//! back, incoming traffic walks it back to front.
//!
//! Rules every implementation follows:
//! - deterministic for a given input and internal state
//! - internal state belongs to the stage instance and is never shared across
//!   connections
//! - failures are returned as [`StageError`], never panics
//! - a stage that replaces a payload buffer releases the old one to the pool

use std::{fmt, time::Instant};

use network_shared::{BufferPool, ConnectionId, LinkStats};
use thiserror::Error;

use crate::{
    message::Message,
    stages::{flow_control::FlowState, quality::QualityHandle},
};

/// Position-defining stage category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Protocol,
    Compression,
    Encryption,
    FlowControl,
    Quality,
}

impl StageKind {
    /// Outgoing order of a complete pipeline. Incoming order is the reverse.
    pub const OUTGOING_ORDER: [StageKind; 5] = [
        StageKind::Protocol,
        StageKind::Compression,
        StageKind::Encryption,
        StageKind::FlowControl,
        StageKind::Quality,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Compression => "compression",
            Self::Encryption => "encryption",
            Self::FlowControl => "flow_control",
            Self::Quality => "quality",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transform failure subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageErrorKind {
    /// Outgoing transform failed (oversize payload, key exhaustion).
    EncodeError,
    /// Incoming bytes were malformed, tampered or out of sequence.
    DecodeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {detail}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub detail: String,
}

impl StageError {
    pub fn encode(detail: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::EncodeError,
            detail: detail.into(),
        }
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::DecodeError,
            detail: detail.into(),
        }
    }
}

/// Outcome of an outgoing transform.
#[derive(Debug)]
pub enum Flow {
    /// Hand the message to the next stage.
    Forward(Message),
    /// The stage kept the message; it comes back out through [`Stage::poll_release`].
    Queued,
    /// Backpressure: the stage refused the message and released its buffer.
    Rejected,
}

/// Per-call environment handed to a stage.
pub struct StageContext<'a> {
    pub connection_id: ConnectionId,
    pub now: Instant,
    pub pool: &'a mut BufferPool,
}

/// Per-tick input: time and the transport's cumulative counters.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub now: Instant,
    pub link: LinkStats,
}

pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    /// Diagnostic name, used in failure reports.
    fn name(&self) -> &str {
        self.kind().label()
    }

    fn outgoing(&mut self, msg: Message, cx: &mut StageContext<'_>) -> Result<Flow, StageError>;

    fn incoming(&mut self, msg: Message, cx: &mut StageContext<'_>) -> Result<Message, StageError>;

    /// Called once the whole incoming chain accepted the message that was
    /// last passed to `incoming`. Observations taken from a message that a
    /// later stage rejects are never committed.
    fn commit_incoming(&mut self, _cx: &mut StageContext<'_>) {}

    /// Called once per tick before queued messages are flushed.
    fn on_tick(&mut self, _tick: &TickContext) {}

    /// Next queued message that may continue down the outgoing chain.
    fn poll_release(&mut self) -> Option<Message> {
        None
    }

    /// Messages currently held by the stage.
    fn queued(&self) -> usize {
        0
    }

    fn flow_state(&self) -> Option<FlowState> {
        None
    }

    fn quality_handle(&self) -> Option<QualityHandle> {
        None
    }

    /// Releases stage-owned resources. Called exactly once, also for stages
    /// of a pipeline that never finished assembling.
    fn dispose(&mut self) {}
}
