//! Transport contract consumed by the pipeline.
//!
//! The pipeline never performs I/O itself. A `Transporter` is polled from the
//! owning tick loop: bytes handed to `send` are queued by the implementation,
//! received packets are pulled with `poll_received`. Nothing here blocks.

pub mod loopback;

use bytes::Bytes;

use crate::events::{LinkStats, TransportCapabilities, TransportError};

pub use loopback::{LossPattern, LoopbackPair, LoopbackTransporter};

/// Link state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransporterState {
    Connecting,
    Connected,
    Closed,
    Faulted,
}

impl TransporterState {
    /// Closed or faulted; the link will not carry traffic again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

/// Minimal transport contract (send bytes, report link state, deliver received bytes).
pub trait Transporter: Send {
    /// Queue one packet for transmission.
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError>;

    /// Current link state.
    fn state(&self) -> TransporterState;

    /// Pull the next received packet, if any. Packets keep their arrival order.
    fn poll_received(&mut self) -> Option<Bytes>;

    /// Request teardown. Idempotent.
    fn close(&mut self);

    /// Cumulative link counters. Transports without loss detection report zeros.
    fn link_stats(&self) -> LinkStats {
        LinkStats::default()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }
}

impl<T: Transporter + ?Sized> Transporter for Box<T> {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn state(&self) -> TransporterState {
        (**self).state()
    }

    fn poll_received(&mut self) -> Option<Bytes> {
        (**self).poll_received()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn link_stats(&self) -> LinkStats {
        (**self).link_stats()
    }

    fn capabilities(&self) -> TransportCapabilities {
        (**self).capabilities()
    }
}
