/*!
Connection Lifecycle

States:
- Connecting: transport not up yet; the handshaker is already started so its
  timeout covers the connect wait.
- Handshaking: link up, handshaker polled once per `update`.
- Ready: exactly one owned [`MessagePipeline`]; all traffic goes through it.
- Closing: teardown requested (locally, by escalation or by a failure).
- Closed: terminal; transport closed, pipeline disposed.

Events are returned from `update` in the order they happened. Stage failures
are message-scoped; only `max_consecutive_decode_failures` decode failures in
a row escalate to Closing (`LinkCorrupted`).

Logging target: `net::connection`
*/

use crossbeam::channel::{self, Receiver, Sender};
use network_shared::{CloseReason, ConnectionId, Transporter, TransporterState};
use tracing::{debug, info, warn};

use crate::{
    context::NetworkContext,
    error::{ErrorKind, HandshakeError, NetError, StageFailure},
    handshake::{HandShaker, HandshakeState},
    message::Message,
    pipeline::{MessagePipeline, SendOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Something the owner of a connection should know about.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake done, `send` is accepted from now on.
    Ready,
    /// One decoded application payload.
    Message(Message),
    /// A message was dropped by a stage; the connection stays up.
    StageFailure(StageFailure),
    HandshakeFailed(HandshakeError),
    /// Terminal; emitted exactly once.
    Closed(CloseReason),
}

pub struct Connection {
    id: ConnectionId,
    context: NetworkContext,
    transport: Box<dyn Transporter>,
    handshaker: Box<dyn HandShaker>,
    state: ConnectionState,
    pipeline: Option<MessagePipeline>,
    completed_tx: Sender<MessagePipeline>,
    completed_rx: Receiver<MessagePipeline>,
    handshake_started: bool,
    decode_failures: u32,
    close_reason: Option<CloseReason>,
}

impl Connection {
    pub fn new(
        context: NetworkContext,
        transport: Box<dyn Transporter>,
        handshaker: Box<dyn HandShaker>,
    ) -> Self {
        let (completed_tx, completed_rx) = channel::bounded(1);
        Self {
            id: context.connection_id(),
            context,
            transport,
            handshaker,
            state: ConnectionState::Connecting,
            pipeline: None,
            completed_tx,
            completed_rx,
            handshake_started: false,
            decode_failures: 0,
            close_reason: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// The assembled pipeline, once Ready.
    pub fn pipeline(&self) -> Option<&MessagePipeline> {
        self.pipeline.as_ref()
    }

    /// Sends one payload. Only valid while Ready.
    pub fn send(&mut self, payload: &[u8]) -> Result<SendOutcome, NetError> {
        let pipeline = match (self.state, self.pipeline.as_mut()) {
            (ConnectionState::Ready, Some(pipeline)) => pipeline,
            _ => return Err(NetError::NotReady(self.id)),
        };
        pipeline.send_outgoing(payload, self.transport.as_mut())
    }

    /// Hands a delivered message's buffer back to the pipeline pool.
    pub fn recycle(&mut self, msg: Message) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.recycle(msg);
        }
    }

    /// Requests a graceful close; the `Closed` event follows on the next `update`.
    pub fn close(&mut self) {
        self.begin_close(CloseReason::Graceful);
    }

    /// One tick.
    pub fn update(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        match self.state {
            ConnectionState::Connecting | ConnectionState::Handshaking => self.drive_handshake(&mut events),
            ConnectionState::Ready => self.drive_pipeline(&mut events),
            ConnectionState::Closing => {}
            ConnectionState::Closed => return events,
        }
        if self.state == ConnectionState::Closing {
            self.finish_close(&mut events);
        }
        events
    }

    fn drive_handshake(&mut self, events: &mut Vec<ConnectionEvent>) {
        if !self.handshake_started {
            let tx = self.completed_tx.clone();
            self.handshaker.start(Box::new(move |pipeline| {
                // Capacity 1 and a single completion: this cannot be full.
                let _ = tx.try_send(pipeline);
            }));
            self.handshake_started = true;
        }
        if self.state == ConnectionState::Connecting && self.transport.state() == TransporterState::Connected {
            self.state = ConnectionState::Handshaking;
            debug!(target: "net::connection", conn = %self.id, "link up, handshaking");
        }

        match self.handshaker.update(self.transport.as_mut()) {
            HandshakeState::Idle | HandshakeState::InProgress => {}
            HandshakeState::Done => match self.completed_rx.try_recv() {
                Ok(pipeline) => {
                    info!(
                        target: "net::connection",
                        conn = %self.id,
                        stages = ?pipeline.stage_names(),
                        "connection ready"
                    );
                    self.pipeline = Some(pipeline);
                    self.state = ConnectionState::Ready;
                    events.push(ConnectionEvent::Ready);
                    // The peer may already have sent traffic behind its handshake reply.
                    self.receive_pending(events);
                }
                Err(_) => {
                    warn!(target: "net::connection", conn = %self.id, "handshake done without a pipeline");
                    self.begin_close(CloseReason::HandshakeFailed);
                }
            },
            HandshakeState::Failed => {
                let error = self.handshaker.error().cloned();
                let reason = match error.as_ref().map(HandshakeError::kind) {
                    Some(ErrorKind::HandshakeTimeout) => CloseReason::Timeout,
                    Some(ErrorKind::TransportFault) => CloseReason::TransportError,
                    _ => CloseReason::HandshakeFailed,
                };
                self.handshaker.on_destroy(self.transport.as_mut(), true);
                if let Some(error) = error {
                    events.push(ConnectionEvent::HandshakeFailed(error));
                }
                self.begin_close(reason);
            }
        }
    }

    fn drive_pipeline(&mut self, events: &mut Vec<ConnectionEvent>) {
        let link = self.transport.state();
        if link.is_terminal() {
            // Packets the transport already delivered still reach the owner.
            self.receive_pending(events);
            let reason = match link {
                TransporterState::Closed => CloseReason::Graceful,
                _ => CloseReason::TransportError,
            };
            self.begin_close(reason);
            return;
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            self.begin_close(CloseReason::TransportError);
            return;
        };
        match pipeline.update(self.transport.as_mut()) {
            Ok(_) => {}
            Err(NetError::Stage(failure)) => events.push(ConnectionEvent::StageFailure(failure)),
            Err(err) => {
                warn!(target: "net::connection", conn = %self.id, "flush failed: {err}");
                if err.kind() == ErrorKind::TransportFault {
                    self.begin_close(CloseReason::TransportError);
                    return;
                }
            }
        }
        self.receive_pending(events);
    }

    fn receive_pending(&mut self, events: &mut Vec<ConnectionEvent>) {
        let limit = self.context.settings().max_consecutive_decode_failures;
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        while let Some(packet) = self.transport.poll_received() {
            match pipeline.receive_incoming(&packet) {
                Ok(msg) => {
                    self.decode_failures = 0;
                    events.push(ConnectionEvent::Message(msg));
                }
                Err(failure) => {
                    self.decode_failures += 1;
                    events.push(ConnectionEvent::StageFailure(failure));
                    if self.decode_failures >= limit {
                        warn!(
                            target: "net::connection",
                            conn = %self.id,
                            failures = self.decode_failures,
                            "consecutive decode failures, link considered corrupted"
                        );
                        self.begin_close(CloseReason::LinkCorrupted);
                        return;
                    }
                }
            }
        }
    }

    fn begin_close(&mut self, reason: CloseReason) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        debug!(target: "net::connection", conn = %self.id, ?reason, from = ?self.state, "closing");
        self.close_reason = Some(reason);
        self.state = ConnectionState::Closing;
    }

    fn finish_close(&mut self, events: &mut Vec<ConnectionEvent>) {
        let reason = self.close_reason.unwrap_or(CloseReason::Graceful);
        self.handshaker.on_destroy(self.transport.as_mut(), true);
        self.pipeline = None;
        self.transport.close();
        self.state = ConnectionState::Closed;
        info!(target: "net::connection", conn = %self.id, ?reason, "connection closed");
        events.push(ConnectionEvent::Closed(reason));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.handshaker.on_destroy(self.transport.as_mut(), true);
            self.pipeline = None;
            self.transport.close();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.context.name())
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use network_shared::{
        ConnectionId, NetworkSettings,
        transport::{LoopbackPair, LoopbackTransporter},
    };

    use super::*;
    use crate::handshake::TrivialHandShaker;

    fn trusted(pair_side: LoopbackTransporter, id: u64) -> Connection {
        let context =
            NetworkContext::new("test", NetworkSettings::default()).with_connection_id(ConnectionId::new(id));
        let handshaker = Box::new(TrivialHandShaker::new(context.clone()));
        Connection::new(context, Box::new(pair_side), handshaker)
    }

    #[test]
    fn waits_in_connecting_until_link_is_up() {
        let (mut client_side, server_side) = LoopbackPair::new().split();
        let mut conn = trusted(server_side, 1);
        assert!(conn.update().is_empty());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(matches!(conn.send(b"x"), Err(NetError::NotReady(_))));

        client_side.connect();
        let events = conn.update();
        assert!(matches!(events.as_slice(), [ConnectionEvent::Ready]));
        assert!(conn.is_ready());
        assert_eq!(conn.pipeline().map(MessagePipeline::len), Some(5));
    }

    #[test]
    fn graceful_close_emits_single_closed_event() {
        let (client_side, server_side) = LoopbackPair::connected().split();
        let mut conn = trusted(server_side, 2);
        conn.update();
        conn.close();
        let events = conn.update();
        assert!(matches!(events.as_slice(), [ConnectionEvent::Closed(CloseReason::Graceful)]));
        assert!(conn.update().is_empty());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(client_side.state().is_terminal());
    }

    #[test]
    fn transport_fault_while_ready_closes() {
        let (client_side, server_side) = LoopbackPair::connected().split();
        let mut conn = trusted(server_side, 3);
        conn.update();
        client_side.fault();
        let events = conn.update();
        assert!(matches!(
            events.as_slice(),
            [ConnectionEvent::Closed(CloseReason::TransportError)]
        ));
    }

    #[test]
    fn messages_sent_before_peer_close_are_delivered() {
        let (client_side, server_side) = LoopbackPair::connected().split();
        let mut sender = trusted(client_side, 5);
        let mut receiver = trusted(server_side, 6);
        sender.update();
        receiver.update();

        sender.send(b"last words").unwrap();
        sender.send(b"really last").unwrap();
        sender.close();
        assert!(matches!(
            sender.update().as_slice(),
            [ConnectionEvent::Closed(CloseReason::Graceful)]
        ));

        let events = receiver.update();
        let payloads: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Message(msg) => Some(msg.payload()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![&b"last words"[..], &b"really last"[..]]);
        assert!(matches!(
            events.last(),
            Some(ConnectionEvent::Closed(CloseReason::Graceful))
        ));
        assert_eq!(receiver.state(), ConnectionState::Closed);
    }

    #[test]
    fn garbage_is_message_scoped_until_threshold() {
        let (mut client_side, server_side) = LoopbackPair::connected().split();
        let mut conn = trusted(server_side, 4);
        conn.update();

        client_side.send(Bytes::from_static(&[1, 2, 3])).unwrap();
        let events = conn.update();
        assert!(matches!(events.as_slice(), [ConnectionEvent::StageFailure(_)]));
        assert!(conn.is_ready());

        client_side.send(Bytes::from_static(&[4, 5, 6])).unwrap();
        client_side.send(Bytes::from_static(&[7, 8, 9])).unwrap();
        let events = conn.update();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last(),
            Some(ConnectionEvent::Closed(CloseReason::LinkCorrupted))
        ));
    }
}
