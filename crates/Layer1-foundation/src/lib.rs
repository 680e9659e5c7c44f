//! # crucible-foundation
//!
//! Foundation layer for Crucible:
//! - Error: the workspace-wide `Error` / `Result`
//! - Config: `SandboxConfig` loaded from global and project TOML files
//! - Event: the fire-and-forget `EventBus` and lifecycle event constructors

pub mod config;
pub mod error;
pub mod event;

pub use config::{
    AgentSettings, ConfigStore, ContainerDefaults, EngineSettings, EventSettings,
    ExecutionSettings, RuntimeSelection, SandboxConfig,
};
pub use error::{Error, Result};
pub use event::{
    EventBus, EventBusConfig, EventCategory, EventFilter, EventListener, EventSeverity,
    ListenerId, SandboxEvent,
};

impl From<&EventSettings> for EventBusConfig {
    fn from(settings: &EventSettings) -> Self {
        Self {
            channel_capacity: settings.channel_capacity,
            history_size: settings.history_size,
            debug_mode: false,
        }
    }
}
