//! Loopback transport for in-memory connection pairs.
//!
//! Keeps both ends of a link in the same process without touching the network
//! stack. Used for local/trusted links and as the test transport for the
//! pipeline. Supports simple fault injection: packet loss patterns (reported
//! through [`LinkStats`]), raw byte injection and link faults.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::events::{LinkStats, TransportCapabilities, TransportError};

use super::{Transporter, TransporterState};

/// Loopback transport capabilities.
///
/// In-memory delivery is reliable and ordered unless a loss pattern is set.
const LOOPBACK_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    reliable: true,
    ordered: true,
    max_packet_size: 1024 * 1024,
};

/// Which packets a loopback half silently drops on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossPattern {
    #[default]
    None,
    /// Drop every n-th packet (1-based). `EveryNth(1)` drops everything.
    EveryNth(u32),
    /// Drop every packet.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Debug, Default)]
struct HalfState {
    inbound: VecDeque<Bytes>,
    loss: LossPattern,
    send_counter: u64,
    stats: LinkStats,
}

impl HalfState {
    fn should_drop(&mut self) -> bool {
        self.send_counter += 1;
        match self.loss {
            LossPattern::None => false,
            LossPattern::All => true,
            LossPattern::EveryNth(0) => false,
            LossPattern::EveryNth(n) => self.send_counter % u64::from(n) == 0,
        }
    }
}

#[derive(Debug)]
struct SharedLoopbackState {
    link: TransporterState,
    client: HalfState,
    server: HalfState,
}

impl SharedLoopbackState {
    fn new() -> Self {
        Self {
            link: TransporterState::Connecting,
            client: HalfState::default(),
            server: HalfState::default(),
        }
    }

    fn halves(&mut self, side: Side) -> (&mut HalfState, &mut HalfState) {
        match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        }
    }
}

/// A pair of connected loopback transports (client and server halves).
pub struct LoopbackPair {
    pub client: LoopbackTransporter,
    pub server: LoopbackTransporter,
}

impl LoopbackPair {
    /// Creates a pair in `Connecting` state; call [`LoopbackTransporter::connect`] on either half.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(SharedLoopbackState::new()));
        Self {
            client: LoopbackTransporter::new(Arc::clone(&state), Side::Client),
            server: LoopbackTransporter::new(state, Side::Server),
        }
    }

    /// Creates a pair whose link is already up.
    pub fn connected() -> Self {
        let mut pair = Self::new();
        pair.client.connect();
        pair
    }

    pub fn split(self) -> (LoopbackTransporter, LoopbackTransporter) {
        (self.client, self.server)
    }
}

impl Default for LoopbackPair {
    fn default() -> Self {
        Self::new()
    }
}

/// One half of a loopback link.
///
/// Cloning yields another handle onto the same half (useful for fault
/// injection from a test while the connection owns the original).
#[derive(Clone)]
pub struct LoopbackTransporter {
    state: Arc<Mutex<SharedLoopbackState>>,
    side: Side,
}

impl LoopbackTransporter {
    fn new(state: Arc<Mutex<SharedLoopbackState>>, side: Side) -> Self {
        Self { state, side }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SharedLoopbackState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Brings the shared link up. No-op once closed or faulted.
    pub fn connect(&mut self) {
        self.with_state(|state| {
            if state.link == TransporterState::Connecting {
                state.link = TransporterState::Connected;
            }
        });
    }

    /// Sets the loss pattern applied to packets *sent* by this half.
    pub fn set_loss(&self, loss: LossPattern) {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.loss = loss);
    }

    /// Places raw bytes into this half's receive queue as if they came off the wire.
    pub fn inject_received(&self, bytes: Bytes) {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.inbound.push_back(bytes));
    }

    /// Marks the link as faulted (both halves observe it).
    pub fn fault(&self) {
        self.with_state(|state| state.link = TransporterState::Faulted);
        debug!(target: "net::transport", side = ?self.side, "loopback link faulted");
    }

    /// Number of packets waiting in this half's receive queue.
    pub fn pending_received(&self) -> usize {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.inbound.len())
    }

    /// Removes and returns everything queued for this half.
    pub fn drain_received(&mut self) -> Vec<Bytes> {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.inbound.drain(..).collect())
    }
}

impl std::fmt::Debug for LoopbackTransporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransporter")
            .field("side", &self.side)
            .field("state", &self.state())
            .finish()
    }
}

impl Transporter for LoopbackTransporter {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        let side = self.side;
        self.with_state(|state| {
            match state.link {
                TransporterState::Connected => {}
                TransporterState::Connecting => return Err(TransportError::NotReady),
                TransporterState::Closed => return Err(TransportError::Closed),
                TransporterState::Faulted => {
                    return Err(TransportError::Faulted("loopback link faulted".into()));
                }
            }
            let (local, remote) = state.halves(side);
            local.stats.packets_sent += 1;
            if local.should_drop() {
                local.stats.packets_lost += 1;
                trace!(target: "net::transport", ?side, len = bytes.len(), "loopback dropped packet");
                return Ok(());
            }
            remote.stats.packets_received += 1;
            remote.inbound.push_back(bytes);
            Ok(())
        })
    }

    fn state(&self) -> TransporterState {
        self.with_state(|state| state.link)
    }

    fn poll_received(&mut self) -> Option<Bytes> {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.inbound.pop_front())
    }

    fn close(&mut self) {
        self.with_state(|state| {
            if state.link != TransporterState::Faulted {
                state.link = TransporterState::Closed;
            }
        });
    }

    fn link_stats(&self) -> LinkStats {
        let side = self.side;
        self.with_state(|state| state.halves(side).0.stats)
    }

    fn capabilities(&self) -> TransportCapabilities {
        LOOPBACK_CAPABILITIES
    }
}
