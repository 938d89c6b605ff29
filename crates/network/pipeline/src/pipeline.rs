//! Message pipeline: ordered, mirrored stage chain of one connection.
//!
//! Outgoing: Protocol -> Compression -> Encryption -> FlowControl -> Quality -> transport
//! Incoming: transport -> Quality -> FlowControl -> Encryption -> Compression -> Protocol
//!
//! The stage list is fixed at construction. Incoming traffic walks the same
//! list in reverse, so the mirror property cannot drift.
//!
//! Error Handling:
//! - A stage failure aborts that one message and is reported as [`StageFailure`];
//!   the partially transformed buffer goes back to the pool, nothing reaches
//!   the transport.
//! - Transport send errors surface as `NetError::Transport`.
//!
//! Logging target: `net::pipeline`.

use std::fmt;

use network_shared::{
    BufferPool, ConnectionId, PoolStats, Transporter,
    messaging::frames::{CompressionKind, EncryptionKind},
};
use tracing::{debug, info, trace, warn};

use crate::{
    context::NetworkContext,
    error::{AssemblyError, NetError, StageFailure},
    message::{Direction, Message},
    stage::{Flow, Stage, StageContext, StageError, StageKind, TickContext},
    stages::{
        codec::CodecStage,
        flow_control::FlowState,
        quality::{QualityHandle, QualityMetrics},
    },
};

/// What happened to one `send_outgoing` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bytes were handed to the transport.
    Delivered,
    /// Held by flow control; goes out on a later `update`.
    Queued,
    /// Dropped by flow control (backpressure).
    Rejected,
}

pub struct MessagePipeline {
    context: NetworkContext,
    stages: Vec<Box<dyn Stage>>,
    pool: BufferPool,
    quality: QualityHandle,
    next_outgoing: u64,
}

impl MessagePipeline {
    /// Wraps an already built stage list. The list must follow
    /// [`StageKind::OUTGOING_ORDER`]; otherwise every stage is disposed and
    /// assembly fails.
    pub fn from_stages(
        context: NetworkContext,
        mut stages: Vec<Box<dyn Stage>>,
    ) -> Result<Self, AssemblyError> {
        let found: Vec<StageKind> = stages.iter().map(|s| s.kind()).collect();
        if found != StageKind::OUTGOING_ORDER {
            dispose_all(&mut stages);
            return Err(AssemblyError::StageOrder { found });
        }

        let quality = stages
            .iter()
            .find_map(|s| s.quality_handle())
            .unwrap_or_default();
        let pool = BufferPool::from_settings(&context.settings().pool);
        let pipeline = Self {
            context,
            stages,
            pool,
            quality,
            next_outgoing: 1,
        };
        info!(
            target: "net::pipeline",
            conn = %pipeline.connection_id(),
            name = pipeline.context.name(),
            stages = ?pipeline.stage_names(),
            "pipeline assembled"
        );
        Ok(pipeline)
    }

    /// Builds the full chain for negotiated codecs, using the context's
    /// stage factory for quality and flow control. Stages built before a
    /// failure are disposed.
    pub fn assemble(
        context: &NetworkContext,
        transport: &dyn Transporter,
        compression: CompressionKind,
        encryption: EncryptionKind,
    ) -> Result<Self, AssemblyError> {
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(StageKind::OUTGOING_ORDER.len());
        match build_stages(context, transport, compression, encryption, &mut stages) {
            Ok(()) => Self::from_stages(context.clone(), stages),
            Err(err) => {
                warn!(
                    target: "net::pipeline",
                    conn = %context.connection_id(),
                    built = stages.len(),
                    "pipeline assembly failed: {err}"
                );
                dispose_all(&mut stages);
                Err(err)
            }
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.context.connection_id()
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    /// Sends one application payload through the outgoing chain.
    pub fn send_outgoing(
        &mut self,
        payload: &[u8],
        transport: &mut dyn Transporter,
    ) -> Result<SendOutcome, NetError> {
        let mut buf = self.pool.acquire(payload.len());
        buf.extend_from_slice(payload);
        let sequence = self.next_outgoing;
        self.next_outgoing += 1;
        self.forward_from(0, Message::new(sequence, Direction::Outgoing, buf), transport)
    }

    /// Runs raw transport bytes through the incoming chain.
    ///
    /// On failure the bytes are dropped; stage state stays usable for the
    /// next packet. Stages commit what they observed only after every stage
    /// accepted the message.
    pub fn receive_incoming(&mut self, raw: &[u8]) -> Result<Message, StageFailure> {
        let mut buf = self.pool.acquire(raw.len());
        buf.extend_from_slice(raw);
        let mut msg = Message::new(0, Direction::Incoming, buf);
        let connection_id = self.context.connection_id();
        let now = self.context.now();

        for idx in (0..self.stages.len()).rev() {
            let mut cx = StageContext {
                connection_id,
                now,
                pool: &mut self.pool,
            };
            match self.stages[idx].incoming(msg, &mut cx) {
                Ok(next) => msg = next,
                Err(error) => return Err(self.failure(idx, Direction::Incoming, error)),
            }
        }
        for stage in self.stages.iter_mut().rev() {
            let mut cx = StageContext {
                connection_id,
                now,
                pool: &mut self.pool,
            };
            stage.commit_incoming(&mut cx);
        }
        trace!(target: "net::pipeline", conn = %connection_id, sequence = msg.sequence(), len = msg.size(), "received");
        Ok(msg)
    }

    /// One tick: feeds time and link counters to every stage (transport side
    /// first, so flow control sees fresh quality metrics), then flushes
    /// released messages in FIFO order. Returns the number flushed.
    pub fn update(&mut self, transport: &mut dyn Transporter) -> Result<usize, NetError> {
        let tick = TickContext {
            now: self.context.now(),
            link: transport.link_stats(),
        };
        for stage in self.stages.iter_mut().rev() {
            stage.on_tick(&tick);
        }

        let mut flushed = 0;
        for idx in 0..self.stages.len() {
            while let Some(msg) = self.stages[idx].poll_release() {
                self.forward_from(idx + 1, msg, transport)?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            trace!(target: "net::pipeline", conn = %self.connection_id(), flushed, "released queued messages");
        }
        Ok(flushed)
    }

    /// Returns a received message's buffer to the pool.
    pub fn recycle(&mut self, msg: Message) {
        self.pool.release(msg.into_payload());
    }

    pub fn outgoing_order(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn incoming_order(&self) -> Vec<StageKind> {
        self.stages.iter().rev().map(|s| s.kind()).collect()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn quality_snapshot(&self) -> QualityMetrics {
        self.quality.snapshot()
    }

    pub fn flow_state(&self) -> Option<FlowState> {
        self.stages.iter().find_map(|s| s.flow_state())
    }

    /// Messages held back by flow control.
    pub fn queued(&self) -> usize {
        self.stages.iter().map(|s| s.queued()).sum()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn forward_from(
        &mut self,
        start: usize,
        mut msg: Message,
        transport: &mut dyn Transporter,
    ) -> Result<SendOutcome, NetError> {
        let connection_id = self.context.connection_id();
        let now = self.context.now();
        let sequence = msg.sequence();

        for idx in start..self.stages.len() {
            let mut cx = StageContext {
                connection_id,
                now,
                pool: &mut self.pool,
            };
            match self.stages[idx].outgoing(msg, &mut cx) {
                Ok(Flow::Forward(next)) => msg = next,
                Ok(Flow::Queued) => {
                    trace!(target: "net::pipeline", conn = %connection_id, sequence, "send queued");
                    return Ok(SendOutcome::Queued);
                }
                Ok(Flow::Rejected) => {
                    debug!(target: "net::pipeline", conn = %connection_id, sequence, "send rejected by {}", self.stages[idx].name());
                    return Ok(SendOutcome::Rejected);
                }
                Err(error) => return Err(self.failure(idx, Direction::Outgoing, error).into()),
            }
        }

        let len = msg.size();
        transport.send(msg.into_payload().freeze())?;
        trace!(target: "net::pipeline", conn = %connection_id, sequence, len, "sent");
        Ok(SendOutcome::Delivered)
    }

    fn failure(&self, idx: usize, direction: Direction, error: StageError) -> StageFailure {
        let stage = &self.stages[idx];
        let failure = StageFailure {
            connection_id: self.context.connection_id(),
            stage: stage.kind(),
            stage_name: stage.name().to_owned(),
            direction,
            error,
        };
        warn!(target: "net::pipeline", "stage failure: {failure}");
        failure
    }
}

impl Drop for MessagePipeline {
    fn drop(&mut self) {
        dispose_all(&mut self.stages);
        self.pool.clear();
        debug!(target: "net::pipeline", conn = %self.context.connection_id(), "pipeline disposed");
    }
}

impl fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("connection_id", &self.connection_id())
            .field("stages", &self.stage_names())
            .field("queued", &self.queued())
            .finish()
    }
}

fn build_stages(
    context: &NetworkContext,
    transport: &dyn Transporter,
    compression: CompressionKind,
    encryption: EncryptionKind,
    stages: &mut Vec<Box<dyn Stage>>,
) -> Result<(), AssemblyError> {
    let settings = context.settings();
    stages.push(Box::new(context.protocol_stage()));
    stages.push(Box::new(CodecStage::compression(compression, settings)?));
    stages.push(Box::new(CodecStage::encryption(encryption, settings)?));

    let mut quality = context
        .factory()
        .create_quality_stage(transport, context.name())?;
    let flow = match context.factory().create_flow_control_stage(&quality, context) {
        Ok(flow) => flow,
        Err(err) => {
            quality.dispose();
            return Err(err);
        }
    };
    stages.push(Box::new(flow));
    stages.push(Box::new(quality));
    Ok(())
}

fn dispose_all(stages: &mut Vec<Box<dyn Stage>>) {
    for stage in stages.iter_mut() {
        stage.dispose();
    }
    stages.clear();
}

#[cfg(test)]
mod tests {
    use network_shared::{NetworkSettings, Transporter, transport::LoopbackPair};

    use super::*;
    use crate::{WIRE_OVERHEAD, stage::StageErrorKind};

    fn pipeline_pair() -> (MessagePipeline, MessagePipeline, LoopbackPair) {
        let pair = LoopbackPair::connected();
        let a = NetworkContext::new("a", NetworkSettings::default());
        let b = NetworkContext::new("b", NetworkSettings::default());
        let tx = MessagePipeline::assemble(&a, &pair.client, CompressionKind::None, EncryptionKind::None).unwrap();
        let rx = MessagePipeline::assemble(&b, &pair.server, CompressionKind::None, EncryptionKind::None).unwrap();
        (tx, rx, pair)
    }

    #[test]
    fn incoming_order_mirrors_outgoing_order() {
        let (tx, _, _) = pipeline_pair();
        assert_eq!(tx.outgoing_order(), StageKind::OUTGOING_ORDER.to_vec());
        let mut reversed = tx.outgoing_order();
        reversed.reverse();
        assert_eq!(tx.incoming_order(), reversed);
        assert_eq!(tx.len(), 5);
        assert_eq!(
            tx.stage_names(),
            vec![
                "protocol",
                "compression:forward",
                "encryption:forward",
                "flow_control",
                "quality"
            ]
        );
    }

    #[test]
    fn forward_codecs_add_constant_overhead() {
        let (mut tx, mut rx, pair) = pipeline_pair();
        let (mut client, mut server) = pair.split();
        let payload = vec![0x5A; 1024];

        assert_eq!(tx.send_outgoing(&payload, &mut client).unwrap(), SendOutcome::Delivered);
        let wire = server.poll_received().unwrap();
        assert_eq!(wire.len(), 1024 + WIRE_OVERHEAD);
        assert_eq!(WIRE_OVERHEAD, 24);

        let msg = rx.receive_incoming(&wire).unwrap();
        assert_eq!(msg.payload(), &payload[..]);
        assert_eq!(msg.sequence(), 1);
        assert_eq!(msg.direction(), Direction::Incoming);
    }

    #[test]
    fn encode_failure_sends_nothing() {
        let pair = LoopbackPair::connected();
        let mut settings = NetworkSettings::default();
        settings.protocol.max_payload_bytes = 8;
        let context = NetworkContext::new("small", settings);
        let mut tx = MessagePipeline::assemble(&context, &pair.client, CompressionKind::None, EncryptionKind::None).unwrap();
        let (mut client, server) = pair.split();

        let failure = match tx.send_outgoing(&[0; 9], &mut client) {
            Err(NetError::Stage(failure)) => failure,
            other => panic!("expected stage failure, got {other:?}"),
        };
        assert_eq!(failure.stage, StageKind::Protocol);
        assert_eq!(failure.direction, Direction::Outgoing);
        assert_eq!(failure.kind(), StageErrorKind::EncodeError);
        assert_eq!(server.pending_received(), 0);

        // The pipeline keeps working afterwards.
        assert_eq!(tx.send_outgoing(&[0; 8], &mut client).unwrap(), SendOutcome::Delivered);
        assert_eq!(server.pending_received(), 1);
    }

    #[test]
    fn decode_failure_names_the_failing_stage() {
        let (_, mut rx, _) = pipeline_pair();
        let failure = rx.receive_incoming(&[1, 2, 3]).unwrap_err();
        assert_eq!(failure.stage, StageKind::Quality);
        assert_eq!(failure.direction, Direction::Incoming);
        assert_eq!(failure.kind(), StageErrorKind::DecodeError);
    }

    #[test]
    fn wrong_stage_order_is_rejected() {
        let context = NetworkContext::new("bad", NetworkSettings::default());
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CodecStage::forward(StageKind::Compression)),
            Box::new(context.protocol_stage()),
        ];
        let err = MessagePipeline::from_stages(context, stages).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::StageOrder {
                found: vec![StageKind::Compression, StageKind::Protocol]
            }
        );
    }

    #[test]
    fn buffers_are_recycled_between_messages() {
        let (mut tx, mut rx, pair) = pipeline_pair();
        let (mut client, mut server) = pair.split();
        for _ in 0..4 {
            tx.send_outgoing(b"recycle me", &mut client).unwrap();
            let wire = server.poll_received().unwrap();
            let msg = rx.receive_incoming(&wire).unwrap();
            rx.recycle(msg);
        }
        assert!(tx.pool_stats().hits > 0);
        assert!(rx.pool_stats().hits > 0);
        assert_eq!(client.link_stats().packets_sent, 4);
    }
}
