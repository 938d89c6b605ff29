/*!
Handshake State Machines

Scope:
- Bring a freshly opened transport link to an assembled [`MessagePipeline`].
- Poll-based: `start` records intent, `update` advances one tick, nothing blocks.
- The completion callback fires at most once; afterwards the handshaker is inert.

Variants:
- [`TrivialHandShaker`]: zero round trips for trusted/local links. Builds the
  chain with pass-through codecs on the first `update`.
- [`NegotiatingHandShaker`]: ClientHello / ServerHello exchange over the raw
  transport (length-prefixed frames, buffered outside any stage), then builds
  the chain with the negotiated codecs.

Failure policy:
- Timeout, version mismatch, malformed or out-of-order frames, assembly errors
  and transport faults end in `Failed`. No retries inside the handshaker.
- Partially built stages are disposed before `Failed` is returned.
- `on_destroy` is idempotent and safe in every state; a destroyed handshaker
  never fires its callback.

Logging target: `net::handshake`
*/

mod negotiating;
mod trivial;

use std::time::{Duration, Instant};

use network_shared::{ConnectionId, Transporter};
use tracing::{debug, info, warn};

pub use negotiating::{NegotiatingHandShaker, Role};
pub use trivial::TrivialHandShaker;

use crate::{error::HandshakeError, pipeline::MessagePipeline};

/// Handshake progress as seen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Not started yet.
    Idle,
    InProgress,
    /// Pipeline delivered to the completion callback.
    Done,
    Failed,
}

impl HandshakeState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Receives the assembled pipeline, at most once.
pub type CompletionCallback = Box<dyn FnOnce(MessagePipeline) + Send>;

pub trait HandShaker: Send {
    /// Records the completion callback and starts the handshake clock.
    /// Calls after the first are ignored.
    fn start(&mut self, on_complete: CompletionCallback);

    /// Advances the state machine by one tick. A no-op once `Done` or `Failed`.
    fn update(&mut self, transport: &mut dyn Transporter) -> HandshakeState;

    /// Releases handshake resources; with `close_socket` also closes the
    /// transport. Idempotent.
    fn on_destroy(&mut self, transport: &mut dyn Transporter, close_socket: bool);

    fn state(&self) -> HandshakeState;

    /// Reason for `Failed`, if the handshake failed on its own.
    fn error(&self) -> Option<&HandshakeError>;
}

/// Bookkeeping shared by both handshakers.
struct HandshakeCore {
    connection_id: ConnectionId,
    state: HandshakeState,
    on_complete: Option<CompletionCallback>,
    error: Option<HandshakeError>,
    started_at: Option<Instant>,
    destroyed: bool,
}

impl HandshakeCore {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            state: HandshakeState::Idle,
            on_complete: None,
            error: None,
            started_at: None,
            destroyed: false,
        }
    }

    fn start(&mut self, on_complete: CompletionCallback, now: Instant) {
        if self.destroyed || self.state != HandshakeState::Idle {
            debug!(target: "net::handshake", conn = %self.connection_id, state = ?self.state, "start ignored");
            return;
        }
        self.on_complete = Some(on_complete);
        self.started_at = Some(now);
        self.state = HandshakeState::InProgress;
        debug!(target: "net::handshake", conn = %self.connection_id, "handshake started");
    }

    /// True while `update` has work to do.
    fn is_active(&self) -> bool {
        self.state == HandshakeState::InProgress && !self.destroyed
    }

    fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.started_at
            .is_some_and(|start| now.saturating_duration_since(start) >= timeout)
    }

    fn complete(&mut self, pipeline: MessagePipeline) -> HandshakeState {
        match self.on_complete.take() {
            Some(on_complete) => {
                info!(target: "net::handshake", conn = %self.connection_id, "handshake complete");
                self.state = HandshakeState::Done;
                on_complete(pipeline);
            }
            None => {
                // Unreachable through the public API: `is_active` guards every caller.
                self.state = HandshakeState::Failed;
            }
        }
        self.state
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeState {
        warn!(target: "net::handshake", conn = %self.connection_id, "handshake failed: {error}");
        self.on_complete = None;
        self.error = Some(error);
        self.state = HandshakeState::Failed;
        self.state
    }

    /// Marks the handshake destroyed. Returns false on repeated calls.
    fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        self.on_complete = None;
        if !self.state.is_finished() {
            self.state = HandshakeState::Failed;
        }
        debug!(target: "net::handshake", conn = %self.connection_id, "handshake destroyed");
        true
    }
}

/// Fails the handshake when the link went away underneath it.
fn check_link(core: &mut HandshakeCore, transport: &dyn Transporter) -> Option<HandshakeState> {
    let link = transport.state();
    if link.is_terminal() {
        return Some(core.fail(HandshakeError::TransportFault(format!(
            "link {link:?} during handshake"
        ))));
    }
    None
}
