/*!
Network Metrics

Scope:
- Plain counters for handshake outcomes, message traffic, stage failures and
  the connection lifecycle.
- Fed from [`ConnectionEvent`]s by the host; counters never go backwards
  except `active_connections`.
- Periodic dump at trace level, paced by the connection clock.

Logging Target:
- net::metrics
*/

use std::time::{Duration, Instant};

use network_shared::CloseReason;
use tracing::trace;

use crate::{
    connection::ConnectionEvent,
    error::{ErrorKind, HandshakeError},
    pipeline::SendOutcome,
    stage::StageErrorKind,
};

/// Core network metric counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetMetrics {
    // Handshake outcomes
    pub handshake_success: u64,
    pub handshake_fail_version: u64,
    pub handshake_fail_malformed: u64,
    pub handshake_fail_rejected: u64,
    pub handshake_fail_assembly: u64,
    pub handshake_fail_transport: u64,
    pub handshake_timeout: u64,

    // Steady state
    pub messages_sent: u64,
    pub messages_received: u64,
    pub sends_queued: u64,
    pub sends_rejected: u64,
    pub encode_failures: u64,
    pub decode_failures: u64,
    /// Connections closed for link corruption.
    pub escalations: u64,

    pub active_connections: u64,
}

impl NetMetrics {
    pub fn reset(&mut self) {
        *self = NetMetrics::default();
    }

    pub fn record_handshake_failure(&mut self, error: &HandshakeError) {
        let counter = match error.kind() {
            ErrorKind::HandshakeTimeout => &mut self.handshake_timeout,
            ErrorKind::HandshakeVersionMismatch => &mut self.handshake_fail_version,
            ErrorKind::HandshakeMalformed => &mut self.handshake_fail_malformed,
            ErrorKind::StageAssemblyFailure => &mut self.handshake_fail_assembly,
            ErrorKind::TransportFault => &mut self.handshake_fail_transport,
            _ => &mut self.handshake_fail_rejected,
        };
        *counter += 1;
    }

    pub fn record_send(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Delivered => self.messages_sent += 1,
            SendOutcome::Queued => self.sends_queued += 1,
            SendOutcome::Rejected => self.sends_rejected += 1,
        }
    }

    pub fn record_stage_failure(&mut self, kind: StageErrorKind) {
        match kind {
            StageErrorKind::EncodeError => self.encode_failures += 1,
            StageErrorKind::DecodeError => self.decode_failures += 1,
        }
    }

    pub fn record_event(&mut self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Ready => {
                self.handshake_success += 1;
            }
            ConnectionEvent::Message(_) => self.messages_received += 1,
            ConnectionEvent::StageFailure(failure) => self.record_stage_failure(failure.kind()),
            ConnectionEvent::HandshakeFailed(error) => self.record_handshake_failure(error),
            ConnectionEvent::Closed(reason) => {
                if *reason == CloseReason::LinkCorrupted {
                    self.escalations += 1;
                }
                self.active_connections = self.active_connections.saturating_sub(1);
            }
        }
    }

    pub fn connection_opened(&mut self) {
        self.active_connections = self.active_connections.saturating_add(1);
    }
}

/// Controls the metrics dump cadence.
#[derive(Debug)]
pub struct MetricsDumpTimer {
    pub interval: Duration,
    pub last: Instant,
}

impl MetricsDumpTimer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    /// Dumps `metrics` when the interval elapsed. Returns whether it did.
    pub fn maybe_dump(&mut self, metrics: &NetMetrics, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        trace!(
            target: "net::metrics",
            "metrics: hs_ok={} hs_ver={} hs_malformed={} hs_rejected={} hs_assembly={} hs_transport={} hs_timeout={} sent={} received={} queued={} rejected={} enc_fail={} dec_fail={} escalations={} active={}",
            metrics.handshake_success,
            metrics.handshake_fail_version,
            metrics.handshake_fail_malformed,
            metrics.handshake_fail_rejected,
            metrics.handshake_fail_assembly,
            metrics.handshake_fail_transport,
            metrics.handshake_timeout,
            metrics.messages_sent,
            metrics.messages_received,
            metrics.sends_queued,
            metrics.sends_rejected,
            metrics.encode_failures,
            metrics.decode_failures,
            metrics.escalations,
            metrics.active_connections
        );
        true
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use network_shared::{ConnectionId, messaging::frames::HandshakeErrorCode};

    use super::*;
    use crate::{error::StageFailure, message::Direction, stage::{StageError, StageKind}};

    #[test]
    fn lifecycle_events_adjust_active_counter() {
        let mut metrics = NetMetrics::default();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.record_event(&ConnectionEvent::Ready);
        metrics.record_event(&ConnectionEvent::Closed(CloseReason::Graceful));
        metrics.record_event(&ConnectionEvent::Closed(CloseReason::LinkCorrupted));
        metrics.record_event(&ConnectionEvent::Closed(CloseReason::Graceful));

        assert_eq!(metrics.handshake_success, 1);
        assert_eq!(metrics.escalations, 1);
        assert_eq!(metrics.active_connections, 0);
    }

    #[test]
    fn handshake_failures_are_bucketed_by_kind() {
        let mut metrics = NetMetrics::default();
        metrics.record_handshake_failure(&HandshakeError::Timeout(Duration::from_secs(5)));
        metrics.record_handshake_failure(&HandshakeError::Rejected {
            code: HandshakeErrorCode::UnsupportedVersion,
            message: "v9".into(),
        });
        metrics.record_handshake_failure(&HandshakeError::NoCommonCodec("none".into()));
        metrics.record_handshake_failure(&HandshakeError::Malformed("junk".into()));

        assert_eq!(metrics.handshake_timeout, 1);
        assert_eq!(metrics.handshake_fail_version, 1);
        assert_eq!(metrics.handshake_fail_rejected, 1);
        assert_eq!(metrics.handshake_fail_malformed, 1);

        metrics.reset();
        assert_eq!(metrics, NetMetrics::default());
    }

    #[test]
    fn stage_failures_and_sends_are_counted() {
        let mut metrics = NetMetrics::default();
        metrics.record_send(SendOutcome::Delivered);
        metrics.record_send(SendOutcome::Queued);
        metrics.record_send(SendOutcome::Rejected);
        metrics.record_event(&ConnectionEvent::StageFailure(StageFailure {
            connection_id: ConnectionId::new(1),
            stage: StageKind::Encryption,
            stage_name: "encryption:xchacha20poly1305".into(),
            direction: Direction::Incoming,
            error: StageError::decode("tag"),
        }));

        assert_eq!(
            (metrics.messages_sent, metrics.sends_queued, metrics.sends_rejected),
            (1, 1, 1)
        );
        assert_eq!(metrics.decode_failures, 1);
    }

    #[test]
    fn dump_respects_interval() {
        let start = Instant::now();
        let mut timer = MetricsDumpTimer::new(Duration::from_secs(10), start);
        let metrics = NetMetrics::default();
        assert!(!timer.maybe_dump(&metrics, start + Duration::from_secs(9)));
        assert!(timer.maybe_dump(&metrics, start + Duration::from_secs(10)));
        assert!(!timer.maybe_dump(&metrics, start + Duration::from_secs(11)));
    }
}
