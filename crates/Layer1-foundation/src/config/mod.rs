//! Config - runtime configuration
//!
//! - `sandbox.rs` - SandboxConfig and its sections
//! - `store.rs` - global/project TOML file lookup

mod sandbox;
mod store;

pub use sandbox::{
    AgentSettings, ContainerDefaults, EngineSettings, EventSettings, ExecutionSettings,
    RuntimeSelection, SandboxConfig, ENV_ENGINE, ENV_IMAGE, SANDBOX_CONFIG_FILE,
};
pub use store::ConfigStore;
