//! Per-connection context and the stage factory contract.

use std::{fmt, sync::Arc, time::Instant};

use network_shared::{ConnectionId, NetworkSettings, SharedClock, SystemClock, Transporter};

use crate::{
    error::AssemblyError,
    stages::{flow_control::FlowControlStage, protocol::ProtocolStage, quality::QualityStage},
};

/// Decides how quality and flow-control stages are instantiated.
pub trait StageFactory: Send + Sync {
    fn create_quality_stage(
        &self,
        transporter: &dyn Transporter,
        connection_name: &str,
    ) -> Result<QualityStage, AssemblyError>;

    fn create_flow_control_stage(
        &self,
        quality: &QualityStage,
        context: &NetworkContext,
    ) -> Result<FlowControlStage, AssemblyError>;
}

/// Factory backed by [`NetworkSettings`], honoring per-connection tuning profiles.
#[derive(Debug, Clone)]
pub struct DefaultStageFactory {
    settings: Arc<NetworkSettings>,
}

impl DefaultStageFactory {
    pub fn new(settings: Arc<NetworkSettings>) -> Self {
        Self { settings }
    }
}

impl StageFactory for DefaultStageFactory {
    fn create_quality_stage(
        &self,
        transporter: &dyn Transporter,
        connection_name: &str,
    ) -> Result<QualityStage, AssemblyError> {
        Ok(QualityStage::new(
            self.settings.quality_for(connection_name).clone(),
            transporter.link_stats(),
        )
        .with_max_packet_size(transporter.capabilities().max_packet_size))
    }

    fn create_flow_control_stage(
        &self,
        quality: &QualityStage,
        context: &NetworkContext,
    ) -> Result<FlowControlStage, AssemblyError> {
        Ok(FlowControlStage::new(
            self.settings.flow_control_for(context.name()).clone(),
            quality.handle(),
        ))
    }
}

/// Identity, settings, time source and stage factory of one connection.
///
/// Cloning is cheap; the pipeline keeps its own clone.
#[derive(Clone)]
pub struct NetworkContext {
    name: Arc<str>,
    connection_id: ConnectionId,
    settings: Arc<NetworkSettings>,
    factory: Arc<dyn StageFactory>,
    clock: SharedClock,
    protocol: ProtocolStage,
}

impl NetworkContext {
    pub fn new(name: impl Into<Arc<str>>, settings: NetworkSettings) -> Self {
        Self::with_shared_settings(name, Arc::new(settings))
    }

    pub fn with_shared_settings(name: impl Into<Arc<str>>, settings: Arc<NetworkSettings>) -> Self {
        Self {
            name: name.into(),
            connection_id: ConnectionId::default(),
            protocol: ProtocolStage::new(&settings.protocol),
            factory: Arc::new(DefaultStageFactory::new(Arc::clone(&settings))),
            settings,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = id;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Diagnostic name; also the key for tuning profiles.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn factory(&self) -> &dyn StageFactory {
        self.factory.as_ref()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Fresh protocol stage for a new pipeline (cloned from the prototype).
    pub fn protocol_stage(&self) -> ProtocolStage {
        self.protocol.fresh()
    }
}

impl fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkContext")
            .field("name", &self.name)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
