use thiserror::Error;

/// Reasons why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Local owner asked for the close, or the peer closed the link cleanly.
    Graceful,
    /// Handshake did not complete in time.
    Timeout,
    /// Handshake failed (version, malformed frame, assembly, rejection).
    HandshakeFailed,
    /// Repeated decode failures indicate a corrupted link.
    LinkCorrupted,
    /// Transport faulted, or closed before the connection was ready.
    TransportError,
}

/// Generic transport level error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,
    #[error("transport closed")]
    Closed,
    #[error("transport faulted: {0}")]
    Faulted(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

/// Capability description for a concrete transport implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub reliable: bool,
    pub ordered: bool,
    /// Largest packet the transport accepts in one `send`.
    pub max_packet_size: usize,
}

impl TransportCapabilities {
    pub const fn new(reliable: bool, ordered: bool, max_packet_size: usize) -> Self {
        Self {
            reliable,
            ordered,
            max_packet_size,
        }
    }
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self::new(true, true, 64 * 1024)
    }
}

/// Cumulative link counters reported by a transport.
///
/// Counters only grow; consumers diff successive reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Packets the transport knows it lost (dropped, expired, unacknowledged).
    pub packets_lost: u64,
}
