//! Container engine surface
//!
//! `ContainerEngine` is the seam between the lifecycle manager and whatever
//! actually runs containers. `CliEngine` drives a Docker- or Podman-compatible
//! command line; `testing::RecordingEngine` scripts the same surface in memory.
//!
//! Engine futures are cancel-safe in the sense that dropping one abandons the
//! underlying invocation; the manager relies on that for timeouts and
//! cancellation.

mod cli;

pub use cli::CliEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::config::ContainerConfig;

// ============================================================================
// Runtime
// ============================================================================

/// Supported container runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Detection order
    pub const ALL: [ContainerRuntime; 2] = [ContainerRuntime::Docker, ContainerRuntime::Podman];

    /// Binary name on PATH
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for ContainerRuntime {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            other => Err(EngineError::NotInstalled(other.to_string())),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine not available: {0}")]
    NotInstalled(String),

    #[error("failed to spawn engine for {operation}: {source}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        operation: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("unexpected engine output for {operation}: {message}")]
    Unexpected { operation: String, message: String },
}

impl EngineError {
    pub fn is_no_such_container(&self) -> bool {
        matches!(self, EngineError::NoSuchContainer(_))
    }
}

impl From<EngineError> for crucible_foundation::Error {
    fn from(err: EngineError) -> Self {
        use crucible_foundation::Error;
        let message = err.to_string();
        match err {
            EngineError::Timeout { .. } => Error::Timeout(message),
            EngineError::Cancelled(_) => Error::Cancelled,
            EngineError::NotInstalled(_) => Error::engine("detect", message),
            EngineError::NoSuchContainer(_) => Error::engine("lookup", message),
            EngineError::Spawn { operation, .. }
            | EngineError::CommandFailed { operation, .. }
            | EngineError::Unexpected { operation, .. } => Error::engine(operation, message),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Engine trait
// ============================================================================

/// Captured output of one exec round-trip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short name for logs ("docker", "podman", ...)
    fn name(&self) -> &str;

    /// Whether the engine answers at all
    async fn is_available(&self) -> bool;

    /// Start a detached keep-alive container, returning the engine's id
    async fn run(&self, config: &ContainerConfig) -> EngineResult<String>;

    /// Run one argument vector inside a running container
    ///
    /// A non-zero exit is a successful round-trip; only failing to reach the
    /// container is an error.
    async fn exec(
        &self,
        runtime_id: &str,
        argv: &[String],
        working_dir: Option<&str>,
    ) -> EngineResult<ExecOutput>;

    /// Network address of the container, empty when it has none
    async fn inspect_address(&self, runtime_id: &str) -> EngineResult<String>;

    async fn logs(&self, runtime_id: &str) -> EngineResult<Vec<String>>;

    async fn stop(&self, runtime_id: &str, timeout: Duration) -> EngineResult<()>;

    async fn remove(&self, runtime_id: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_foundation::Error;

    #[test]
    fn test_runtime_parse() {
        assert_eq!("Docker".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Docker);
        assert_eq!("podman".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Podman);
        assert!("lxc".parse::<ContainerRuntime>().is_err());
        assert_eq!(ContainerRuntime::Podman.to_string(), "podman");
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: Error = EngineError::CommandFailed {
            operation: "run".into(),
            code: Some(125),
            stderr: "image not found".into(),
        }
        .into();
        match err {
            Error::Engine { operation, message } => {
                assert_eq!(operation, "run");
                assert!(message.contains("image not found"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let err: Error = EngineError::Timeout {
            operation: "exec".into(),
            after: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(err, Error::Timeout(_)));

        let err: Error = EngineError::Cancelled("exec".into()).into();
        assert!(matches!(err, Error::Cancelled));
    }
}
