//! Multi-connection owner.
//!
//! Registers connections with the handshaker for their [`HandshakeMode`],
//! ticks them, folds their events into [`NetMetrics`] and drops connections
//! once they report `Closed`. Connections are ticked in id order so event
//! order is reproducible.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use network_shared::{
    ConnectionId, IdGenerator, NetworkSettings, SharedClock, SystemClock, Transporter,
};
use tracing::{debug, info};

use crate::{
    connection::{Connection, ConnectionEvent, ConnectionState},
    context::{NetworkContext, StageFactory},
    error::NetError,
    handshake::{HandShaker, NegotiatingHandShaker, Role, TrivialHandShaker},
    message::Message,
    metrics::{MetricsDumpTimer, NetMetrics},
    pipeline::SendOutcome,
};

/// How new connections are brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Trusted link, pass-through codecs, no round trip.
    Trusted,
    /// Negotiate, sending the ClientHello.
    Initiator,
    /// Negotiate, answering the ClientHello.
    Responder,
}

const METRICS_DUMP_INTERVAL: Duration = Duration::from_secs(10);

pub struct NetworkHost {
    settings: Arc<NetworkSettings>,
    clock: SharedClock,
    factory: Option<Arc<dyn StageFactory>>,
    ids: IdGenerator,
    connections: BTreeMap<ConnectionId, Connection>,
    metrics: NetMetrics,
    dump_timer: MetricsDumpTimer,
}

impl NetworkHost {
    /// Validates `settings` and creates an empty host.
    pub fn new(settings: NetworkSettings) -> Result<Self, NetError> {
        settings.validate()?;
        let clock = SystemClock::shared();
        Ok(Self {
            settings: Arc::new(settings),
            dump_timer: MetricsDumpTimer::new(METRICS_DUMP_INTERVAL, clock.now()),
            clock,
            factory: None,
            ids: IdGenerator::default(),
            connections: BTreeMap::new(),
            metrics: NetMetrics::default(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.dump_timer = MetricsDumpTimer::new(self.dump_timer.interval, clock.now());
        self.clock = clock;
        self
    }

    /// Replaces the settings-backed stage factory for connections created afterwards.
    pub fn with_factory(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_dump_interval(mut self, interval: Duration) -> Self {
        self.dump_timer.interval = interval;
        self
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Wraps `transport` in a new connection. `name` selects tuning profiles.
    pub fn connect(
        &mut self,
        name: &str,
        transport: Box<dyn Transporter>,
        mode: HandshakeMode,
    ) -> ConnectionId {
        let id = self.ids.next_connection();
        let mut context = NetworkContext::with_shared_settings(name, Arc::clone(&self.settings))
            .with_connection_id(id)
            .with_clock(Arc::clone(&self.clock));
        if let Some(factory) = &self.factory {
            context = context.with_factory(Arc::clone(factory));
        }

        let handshaker: Box<dyn HandShaker> = match mode {
            HandshakeMode::Trusted => Box::new(TrivialHandShaker::new(context.clone())),
            HandshakeMode::Initiator => Box::new(NegotiatingHandShaker::new(context.clone(), Role::Initiator)),
            HandshakeMode::Responder => Box::new(NegotiatingHandShaker::new(context.clone(), Role::Responder)),
        };
        self.connections.insert(id, Connection::new(context, transport, handshaker));
        self.metrics.connection_opened();
        info!(target: "net::connection", conn = %id, name, ?mode, "connection registered");
        id
    }

    pub fn send(&mut self, id: ConnectionId, payload: &[u8]) -> Result<SendOutcome, NetError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        match connection.send(payload) {
            Ok(outcome) => {
                self.metrics.record_send(outcome);
                Ok(outcome)
            }
            Err(NetError::Stage(failure)) => {
                self.metrics.record_stage_failure(failure.kind());
                Err(NetError::Stage(failure))
            }
            Err(err) => Err(err),
        }
    }

    /// Ticks every connection once and returns their events in order.
    pub fn update(&mut self) -> Vec<(ConnectionId, ConnectionEvent)> {
        let mut out = Vec::new();
        let mut closed = Vec::new();
        for (id, connection) in self.connections.iter_mut() {
            for event in connection.update() {
                self.metrics.record_event(&event);
                out.push((*id, event));
            }
            if connection.state() == ConnectionState::Closed {
                closed.push(*id);
            }
        }
        for id in closed {
            self.connections.remove(&id);
            debug!(target: "net::connection", conn = %id, "connection removed");
        }
        self.dump_timer.maybe_dump(&self.metrics, self.clock.now());
        out
    }

    /// Starts a graceful close; the `Closed` event arrives with the next `update`.
    pub fn close(&mut self, id: ConnectionId) -> Result<(), NetError> {
        self.connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?
            .close();
        Ok(())
    }

    /// Returns a delivered message's buffer to its connection's pool.
    pub fn recycle(&mut self, id: ConnectionId, msg: Message) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.recycle(msg);
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn metrics(&self) -> &NetMetrics {
        &self.metrics
    }
}
