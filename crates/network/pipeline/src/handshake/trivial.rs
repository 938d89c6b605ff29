//! Zero round-trip handshake for trusted links.

use network_shared::{
    Transporter, TransporterState,
    messaging::frames::{CompressionKind, EncryptionKind},
};

use super::{CompletionCallback, HandShaker, HandshakeCore, HandshakeState, check_link};
use crate::{context::NetworkContext, error::HandshakeError, pipeline::MessagePipeline};

/// Assembles Protocol -> Compression(forward) -> Encryption(forward) ->
/// FlowControl -> Quality on the first `update` of a connected link and
/// completes in that same call.
pub struct TrivialHandShaker {
    context: NetworkContext,
    core: HandshakeCore,
}

impl TrivialHandShaker {
    pub fn new(context: NetworkContext) -> Self {
        Self {
            core: HandshakeCore::new(context.connection_id()),
            context,
        }
    }
}

impl HandShaker for TrivialHandShaker {
    fn start(&mut self, on_complete: CompletionCallback) {
        let now = self.context.now();
        self.core.start(on_complete, now);
    }

    fn update(&mut self, transport: &mut dyn Transporter) -> HandshakeState {
        if !self.core.is_active() {
            return self.core.state;
        }
        if let Some(state) = check_link(&mut self.core, &*transport) {
            return state;
        }
        if transport.state() == TransporterState::Connecting {
            let timeout = self.context.settings().handshake.timeout();
            if self.core.timed_out(self.context.now(), timeout) {
                return self.core.fail(HandshakeError::Timeout(timeout));
            }
            return HandshakeState::InProgress;
        }

        match MessagePipeline::assemble(
            &self.context,
            &*transport,
            CompressionKind::None,
            EncryptionKind::None,
        ) {
            Ok(pipeline) => self.core.complete(pipeline),
            Err(err) => self.core.fail(err.into()),
        }
    }

    fn on_destroy(&mut self, transport: &mut dyn Transporter, close_socket: bool) {
        if self.core.destroy() && close_socket {
            transport.close();
        }
    }

    fn state(&self) -> HandshakeState {
        self.core.state
    }

    fn error(&self) -> Option<&HandshakeError> {
        self.core.error.as_ref()
    }
}
