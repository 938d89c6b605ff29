//! Negotiating handshake over the raw transport.
//!
//! Exchange (one frame per packet, see `network_shared::messaging`):
//!
//! ```text
//! Initiator                         Responder
//!   ClientHello{version, codecs} ->
//!                                <- ServerHello{version, chosen codecs}
//!                                   | HandshakeError{code, message}
//! ```
//!
//! Raw bytes are collected in a [`FrameDecoder`] until a whole frame is
//! available. Packets are pulled one at a time and pulling stops with the
//! first complete frame, so pipeline traffic the peer sends right after its
//! reply stays queued in the transport for the pipeline.

use bytes::Bytes;
use network_shared::{
    PROTOCOL_VERSION, Transporter, TransporterState,
    messaging::{
        codec::{FrameCodec, FrameDecoder},
        frames::{CompressionKind, EncryptionKind, Frame, HandshakeErrorCode, HandshakeFrame},
    },
};
use tracing::{debug, trace};

use super::{CompletionCallback, HandShaker, HandshakeCore, HandshakeState, check_link};
use crate::{context::NetworkContext, error::HandshakeError, pipeline::MessagePipeline};

/// Which side of the exchange this handshaker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `ClientHello`, waits for the reply.
    Initiator,
    /// Waits for `ClientHello`, picks codecs, replies.
    Responder,
}

pub struct NegotiatingHandShaker {
    context: NetworkContext,
    role: Role,
    core: HandshakeCore,
    codec: FrameCodec,
    decoder: FrameDecoder,
    hello_sent: bool,
}

impl NegotiatingHandShaker {
    pub fn new(context: NetworkContext, role: Role) -> Self {
        let max_frame_bytes = context.settings().handshake.max_frame_bytes;
        Self {
            core: HandshakeCore::new(context.connection_id()),
            codec: FrameCodec::new(max_frame_bytes),
            decoder: FrameDecoder::new(max_frame_bytes),
            hello_sent: false,
            context,
            role,
        }
    }

    pub fn initiator(context: NetworkContext) -> Self {
        Self::new(context, Role::Initiator)
    }

    pub fn responder(context: NetworkContext) -> Self {
        Self::new(context, Role::Responder)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Highest locally supported version; what the initiator offers.
    fn offered_version(&self) -> u16 {
        self.context
            .settings()
            .handshake
            .supported_versions
            .iter()
            .copied()
            .max()
            .unwrap_or(PROTOCOL_VERSION)
    }

    fn send_frame(&self, transport: &mut dyn Transporter, frame: &Frame) -> Result<(), HandshakeError> {
        let bytes = self
            .codec
            .encode_to_vec(frame)
            .map_err(|e| HandshakeError::Malformed(format!("encode: {e}")))?;
        transport
            .send(Bytes::from(bytes))
            .map_err(|e| HandshakeError::TransportFault(e.to_string()))
    }

    /// Best effort; the link is torn down afterwards anyway.
    fn send_error(&self, transport: &mut dyn Transporter, code: HandshakeErrorCode, message: &str) {
        if let Err(e) = self.send_frame(transport, &Frame::handshake_error(code, message)) {
            debug!(
                target: "net::handshake",
                conn = %self.context.connection_id(),
                "failed to send HandshakeError({}): {e}",
                code.label()
            );
        }
    }

    fn fail_and_report(
        &mut self,
        transport: &mut dyn Transporter,
        code: HandshakeErrorCode,
        error: HandshakeError,
    ) -> HandshakeState {
        self.send_error(transport, code, &error.to_string());
        self.core.fail(error)
    }

    /// Next complete frame, pulling at most the packets needed for it.
    fn next_frame(&mut self, transport: &mut dyn Transporter) -> Result<Option<Frame>, HandshakeError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if self.decoder.buffered_len() > 0 {
                        return Err(HandshakeError::Malformed(format!(
                            "{} trailing bytes after handshake frame",
                            self.decoder.buffered_len()
                        )));
                    }
                    return Ok(Some(frame));
                }
                Ok(None) => match transport.poll_received() {
                    Some(packet) => self.decoder.push_bytes(&packet),
                    None => return Ok(None),
                },
                Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
            }
        }
    }

    fn assemble(
        &mut self,
        transport: &dyn Transporter,
        compression: CompressionKind,
        encryption: EncryptionKind,
    ) -> Result<MessagePipeline, HandshakeError> {
        MessagePipeline::assemble(&self.context, transport, compression, encryption).map_err(HandshakeError::from)
    }

    fn on_initiator_frame(&mut self, frame: Frame, transport: &mut dyn Transporter) -> HandshakeState {
        let settings = self.context.settings();
        match frame {
            Frame::Handshake(HandshakeFrame::ServerHello {
                accepted_version,
                compression,
                encryption,
            }) => {
                if accepted_version != self.offered_version() {
                    let local = settings.handshake.supported_versions.clone();
                    return self.core.fail(HandshakeError::VersionMismatch {
                        peer: accepted_version,
                        local,
                    });
                }
                if !settings.compression.preferred.contains(&compression)
                    || !settings.encryption.usable().contains(&encryption)
                {
                    let detail = format!(
                        "peer chose codecs {}/{} that were not offered",
                        compression.label(),
                        encryption.label()
                    );
                    return self.fail_and_report(
                        transport,
                        HandshakeErrorCode::Malformed,
                        HandshakeError::Malformed(detail),
                    );
                }
                match self.assemble(&*transport, compression, encryption) {
                    Ok(pipeline) => self.core.complete(pipeline),
                    Err(err) => self.core.fail(err),
                }
            }
            Frame::Handshake(HandshakeFrame::HandshakeError { code, message }) => {
                self.core.fail(HandshakeError::Rejected { code, message })
            }
            Frame::Handshake(HandshakeFrame::ClientHello { .. }) => self.fail_and_report(
                transport,
                HandshakeErrorCode::Malformed,
                HandshakeError::Malformed("unexpected ClientHello at initiator".into()),
            ),
        }
    }

    fn on_responder_frame(&mut self, frame: Frame, transport: &mut dyn Transporter) -> HandshakeState {
        let settings = self.context.settings();
        match frame {
            Frame::Handshake(HandshakeFrame::ClientHello {
                version,
                compression,
                encryption,
            }) => {
                let local = &settings.handshake.supported_versions;
                if !local.contains(&version) {
                    let error = HandshakeError::VersionMismatch {
                        peer: version,
                        local: local.clone(),
                    };
                    return self.fail_and_report(transport, HandshakeErrorCode::UnsupportedVersion, error);
                }

                let chosen_compression = settings
                    .compression
                    .preferred
                    .iter()
                    .copied()
                    .find(|c| compression.contains(c));
                let chosen_encryption = settings
                    .encryption
                    .usable()
                    .into_iter()
                    .find(|e| encryption.contains(e));
                let (Some(chosen_compression), Some(chosen_encryption)) =
                    (chosen_compression, chosen_encryption)
                else {
                    let error = HandshakeError::NoCommonCodec(format!(
                        "offered compression {compression:?}, encryption {encryption:?}"
                    ));
                    return self.fail_and_report(transport, HandshakeErrorCode::NoCommonCodec, error);
                };

                let pipeline = match self.assemble(&*transport, chosen_compression, chosen_encryption) {
                    Ok(pipeline) => pipeline,
                    Err(err) => return self.fail_and_report(transport, HandshakeErrorCode::Internal, err),
                };
                let reply = Frame::Handshake(HandshakeFrame::ServerHello {
                    accepted_version: version,
                    compression: chosen_compression,
                    encryption: chosen_encryption,
                });
                if let Err(err) = self.send_frame(transport, &reply) {
                    drop(pipeline);
                    return self.core.fail(err);
                }
                debug!(
                    target: "net::handshake",
                    conn = %self.context.connection_id(),
                    version,
                    compression = chosen_compression.label(),
                    encryption = chosen_encryption.label(),
                    "negotiated"
                );
                self.core.complete(pipeline)
            }
            Frame::Handshake(HandshakeFrame::HandshakeError { code, message }) => {
                self.core.fail(HandshakeError::Rejected { code, message })
            }
            Frame::Handshake(HandshakeFrame::ServerHello { .. }) => self.fail_and_report(
                transport,
                HandshakeErrorCode::Malformed,
                HandshakeError::Malformed("unexpected ServerHello at responder".into()),
            ),
        }
    }
}

impl HandShaker for NegotiatingHandShaker {
    fn start(&mut self, on_complete: CompletionCallback) {
        let now = self.context.now();
        self.core.start(on_complete, now);
    }

    fn update(&mut self, transport: &mut dyn Transporter) -> HandshakeState {
        if !self.core.is_active() {
            return self.core.state;
        }
        if transport.state().is_terminal() {
            // A rejecting peer closes right after its HandshakeError frame.
            if let Ok(Some(Frame::Handshake(HandshakeFrame::HandshakeError { code, message }))) =
                self.next_frame(transport)
            {
                return self.core.fail(HandshakeError::Rejected { code, message });
            }
        }
        if let Some(state) = check_link(&mut self.core, &*transport) {
            return state;
        }

        let timeout = self.context.settings().handshake.timeout();
        if self.core.timed_out(self.context.now(), timeout) {
            if transport.state() == TransporterState::Connected {
                self.send_error(transport, HandshakeErrorCode::Timeout, "handshake timeout");
            }
            return self.core.fail(HandshakeError::Timeout(timeout));
        }
        if transport.state() == TransporterState::Connecting {
            return HandshakeState::InProgress;
        }

        if self.role == Role::Initiator && !self.hello_sent {
            let hello = Frame::Handshake(HandshakeFrame::ClientHello {
                version: self.offered_version(),
                compression: self.context.settings().compression.preferred.clone(),
                encryption: self.context.settings().encryption.usable(),
            });
            if let Err(err) = self.send_frame(transport, &hello) {
                return self.core.fail(err);
            }
            self.hello_sent = true;
            trace!(target: "net::handshake", conn = %self.context.connection_id(), "ClientHello sent");
        }

        match self.next_frame(transport) {
            Ok(None) => HandshakeState::InProgress,
            Ok(Some(frame)) => match self.role {
                Role::Initiator => self.on_initiator_frame(frame, transport),
                Role::Responder => self.on_responder_frame(frame, transport),
            },
            Err(err) => self.fail_and_report(transport, HandshakeErrorCode::Malformed, err),
        }
    }

    fn on_destroy(&mut self, transport: &mut dyn Transporter, close_socket: bool) {
        if self.core.destroy() {
            self.decoder.clear();
            if close_socket {
                transport.close();
            }
        }
    }

    fn state(&self) -> HandshakeState {
        self.core.state
    }

    fn error(&self) -> Option<&HandshakeError> {
        self.core.error.as_ref()
    }
}
