//! Runtime context
//!
//! `SandboxRuntime` owns the engine, the event bus and the container manager
//! for one process. Agents are spawned from it and share all three.

use crate::agent::TaskAgent;
use crate::status::{StatusRelay, StatusSink};
use crucible_container::{CliEngine, ContainerEngine, ContainerManager, ManagerSettings};
use crucible_foundation::event::system;
use crucible_foundation::{EventBus, EventBusConfig, ListenerId, Result, SandboxConfig};
use std::sync::Arc;
use tracing::info;

pub struct SandboxRuntime {
    config: Arc<SandboxConfig>,
    bus: Arc<EventBus>,
    manager: ContainerManager,
}

impl SandboxRuntime {
    /// Detect the configured engine and start the runtime
    pub async fn init(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let engine = CliEngine::detect(config.engine.runtime)?;
        info!("Using container engine: {}", engine.name());
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Start the runtime on an explicit engine
    pub fn with_engine(config: SandboxConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        let bus = Arc::new(EventBus::with_config(EventBusConfig::from(&config.events)));
        let manager = ContainerManager::new(engine, bus.clone(), ManagerSettings::from(&config));
        bus.publish(system::started(env!("CARGO_PKG_VERSION")));

        Self {
            config: Arc::new(config),
            bus,
            manager,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &ContainerManager {
        &self.manager
    }

    pub fn spawn_agent(&self) -> Arc<TaskAgent> {
        let agent = TaskAgent::new(self.manager.clone(), self.bus.clone(), self.config.clone());
        info!(agent_id = %agent.id(), "Spawned agent");
        Arc::new(agent)
    }

    /// Route agent, task and container events into a presenter
    pub fn subscribe_status(&self, sink: Arc<dyn StatusSink>) -> ListenerId {
        self.bus.subscribe(Arc::new(StatusRelay::new(sink)))
    }

    /// Destroy every remaining container, then announce shutdown
    pub async fn shutdown(&self, reason: &str) -> usize {
        let destroyed = self.manager.destroy_all().await;
        info!("Shutdown ({}): destroyed {} container(s)", reason, destroyed);
        self.bus.publish(system::shutdown(reason));
        destroyed
    }
}
