//! Error types of the pipeline crate.
//!
//! Handshake failures are terminal for one attempt, stage failures are
//! message-scoped. [`NetError::kind`] folds everything into the flat
//! [`ErrorKind`] used for metrics and by callers that only care about the
//! category.

use std::time::Duration;

use network_shared::{
    ConnectionId, SettingsError, TransportError, messaging::frames::HandshakeErrorCode,
};
use thiserror::Error;

use crate::{
    message::Direction,
    stage::{StageError, StageErrorKind, StageKind},
};

/// Flat error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    HandshakeTimeout,
    HandshakeVersionMismatch,
    HandshakeMalformed,
    HandshakeRejected,
    StageAssemblyFailure,
    StageTransformFailure(StageErrorKind),
    TransportFault,
    Configuration,
    NotReady,
    UnknownConnection,
}

/// Building a pipeline failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("codec `{codec}` needs a pre-shared key")]
    MissingKey { codec: &'static str },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("{stage} factory failed: {reason}")]
    Factory { stage: StageKind, reason: String },

    #[error("stage order {found:?} is not {:?}", StageKind::OUTGOING_ORDER)]
    StageOrder { found: Vec<StageKind> },
}

impl From<SettingsError> for AssemblyError {
    fn from(err: SettingsError) -> Self {
        Self::Settings(err.to_string())
    }
}

/// Why a handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol version {peer} not supported (local {local:?})")]
    VersionMismatch { peer: u16, local: Vec<u16> },

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("peer rejected handshake ({}): {message}", code.label())]
    Rejected {
        code: HandshakeErrorCode,
        message: String,
    },

    #[error("no common codec: {0}")]
    NoCommonCodec(String),

    #[error("stage assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("transport fault: {0}")]
    TransportFault(String),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::HandshakeTimeout,
            Self::VersionMismatch { .. } => ErrorKind::HandshakeVersionMismatch,
            Self::Malformed(_) => ErrorKind::HandshakeMalformed,
            Self::Rejected {
                code: HandshakeErrorCode::UnsupportedVersion,
                ..
            } => ErrorKind::HandshakeVersionMismatch,
            Self::Rejected {
                code: HandshakeErrorCode::Timeout,
                ..
            } => ErrorKind::HandshakeTimeout,
            Self::Rejected { .. } | Self::NoCommonCodec(_) => ErrorKind::HandshakeRejected,
            Self::Assembly(_) => ErrorKind::StageAssemblyFailure,
            Self::TransportFault(_) => ErrorKind::TransportFault,
        }
    }
}

/// Structured stage failure report: the only error signal a pipeline surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{connection_id} {stage_name} ({direction}): {error}")]
pub struct StageFailure {
    pub connection_id: ConnectionId,
    pub stage: StageKind,
    pub stage_name: String,
    pub direction: Direction,
    pub error: StageError,
}

impl StageFailure {
    pub fn kind(&self) -> StageErrorKind {
        self.error.kind
    }
}

/// Top-level error of the crate.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("{0} is not ready")]
    NotReady(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Handshake(err) => err.kind(),
            Self::Assembly(_) => ErrorKind::StageAssemblyFailure,
            Self::Stage(failure) => ErrorKind::StageTransformFailure(failure.kind()),
            Self::Transport(_) => ErrorKind::TransportFault,
            Self::Settings(_) => ErrorKind::Configuration,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::UnknownConnection(_) => ErrorKind::UnknownConnection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_categories() {
        assert_eq!(
            HandshakeError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::HandshakeTimeout
        );
        assert_eq!(
            HandshakeError::Assembly(AssemblyError::MissingKey { codec: "x" }).kind(),
            ErrorKind::StageAssemblyFailure
        );

        let failure = StageFailure {
            connection_id: ConnectionId::new(3),
            stage: StageKind::Encryption,
            stage_name: "encryption:xchacha20poly1305".into(),
            direction: Direction::Incoming,
            error: StageError::decode("tag mismatch"),
        };
        assert_eq!(
            NetError::from(failure.clone()).kind(),
            ErrorKind::StageTransformFailure(StageErrorKind::DecodeError)
        );
        assert!(failure.to_string().contains("encryption:xchacha20poly1305"));
    }

    #[test]
    fn rejected_message_uses_code_label() {
        let err = HandshakeError::Rejected {
            code: HandshakeErrorCode::NoCommonCodec,
            message: "none".into(),
        };
        assert_eq!(err.to_string(), "peer rejected handshake (no_common_codec): none");
    }
}
