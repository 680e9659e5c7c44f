//! # crucible-container
//!
//! Container lifecycle layer for Crucible.
//!
//! - `engine`: the `ContainerEngine` surface and `CliEngine` (Docker / Podman CLI)
//! - `config`: `ContainerConfig` resolution from defaults plus overrides
//! - `manager`: `ContainerManager` (create, execute, destroy, logs)
//! - `command`: `CommandSpec`, `CommandResult`, `ExecPolicy`
//! - `validate`: checks on values that reach the engine command line
//!
//! ## Example
//!
//! ```ignore
//! use crucible_container::{
//!     CliEngine, CommandSpec, ContainerManager, ContainerOverrides, ExecPolicy,
//! };
//!
//! let engine = Arc::new(CliEngine::detect(RuntimeSelection::Auto)?);
//! let manager = ContainerManager::new(engine, bus, ManagerSettings::default());
//!
//! let instance = manager.create(ContainerOverrides::new().with_memory("1g")).await?;
//! let results = manager
//!     .execute_commands(instance.id, &[CommandSpec::shell("echo hi")], &ExecPolicy::new())
//!     .await?;
//! manager.destroy(instance.id).await?;
//! ```

pub mod command;
pub mod config;
pub mod engine;
pub mod instance;
pub mod log;
pub mod manager;
pub mod validate;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use command::{CommandObserver, CommandResult, CommandSpec, CommandStatus, ExecPolicy};
pub use config::{
    ContainerConfig, ContainerId, ContainerOverrides, ContainerOwner, PortMapping, Protocol,
    VolumeMount,
};
pub use engine::{
    CliEngine, ContainerEngine, ContainerRuntime, EngineError, EngineResult, ExecOutput,
};
pub use instance::{ContainerInstance, ContainerStatus};
pub use log::{LogBuffer, LogEntry, LogLevel};
pub use manager::{ContainerManager, ManagerSettings};
