//! Container instances as tracked by the manager

use crate::config::{ContainerConfig, ContainerId};
use crate::log::LogBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Registered, engine run not yet finished
    Creating,
    Running,
    Stopped,
    Error,
    Destroyed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
            ContainerStatus::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container and everything the manager knows about it
///
/// Snapshots handed out by the manager are clones; mutating one does not
/// affect the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub id: ContainerId,
    pub config: ContainerConfig,
    pub status: ContainerStatus,
    /// Identifier assigned by the engine, set once `run` succeeds
    pub runtime_id: Option<String>,
    /// Resolved network address, set before the instance turns `running`
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub logs: LogBuffer,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
}

impl ContainerInstance {
    pub fn new(config: ContainerConfig, log_lines: usize) -> Self {
        Self {
            id: config.id,
            config,
            status: ContainerStatus::Creating,
            runtime_id: None,
            address: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            logs: LogBuffer::new(log_lines),
            task_id: None,
            agent_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn mark_running(&mut self, address: String) {
        self.status = ContainerStatus::Running;
        self.address = Some(address);
        self.started_at = Some(Utc::now());
        self.logs.push_system(format!("Container {} running", self.config.name));
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ContainerStatus::Error;
        self.ended_at = Some(Utc::now());
        self.logs.push_error(message);
    }

    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.logs.push_system("Container stopped");
    }

    pub fn mark_destroyed(&mut self) {
        self.status = ContainerStatus::Destroyed;
        self.ended_at = Some(Utc::now());
        self.logs.push_system("Container destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerOverrides;
    use crucible_foundation::ContainerDefaults;

    fn instance() -> ContainerInstance {
        let config =
            ContainerConfig::resolve(&ContainerDefaults::default(), ContainerOverrides::new())
                .unwrap();
        ContainerInstance::new(config, 10)
    }

    #[test]
    fn test_new_instance_is_creating() {
        let instance = instance();
        assert_eq!(instance.status, ContainerStatus::Creating);
        assert_eq!(instance.id, instance.config.id);
        assert!(instance.runtime_id.is_none());
        assert!(!instance.is_running());
    }

    #[test]
    fn test_transitions() {
        let mut instance = instance();
        instance.mark_running("172.17.0.2".to_string());
        assert!(instance.is_running());
        assert!(instance.started_at.is_some());

        instance.mark_stopped();
        instance.mark_destroyed();
        assert_eq!(instance.status, ContainerStatus::Destroyed);
        assert!(instance.ended_at.is_some());
        assert_eq!(instance.logs.len(), 3);
    }

    #[test]
    fn test_mark_error_logs_failure() {
        let mut instance = instance();
        instance.mark_error("run failed: image not found");
        assert_eq!(instance.status, ContainerStatus::Error);
        assert_eq!(instance.logs.errors().len(), 1);
        assert_eq!(instance.status.to_string(), "error");
    }
}
