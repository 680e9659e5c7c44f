//! Event Types - events emitted by the container and task layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event ID
// ============================================================================

/// Unique event ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Runtime start/shutdown
    System,
    /// Container lifecycle
    Container,
    /// Task lifecycle and output
    Task,
    /// Agent status
    Agent,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Container => "container",
            Self::Task => "task",
            Self::Agent => "agent",
        }
    }
}

// ============================================================================
// Event Severity
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

// ============================================================================
// SandboxEvent
// ============================================================================

/// One lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub id: EventId,

    /// Dotted type, e.g. "container.created", "task.failed"
    pub event_type: String,

    pub category: EventCategory,

    pub severity: EventSeverity,

    pub timestamp: DateTime<Utc>,

    /// Emitting component
    pub source: String,

    /// Agent the event belongs to, if any
    pub agent_id: Option<String>,

    pub data: Value,
}

impl SandboxEvent {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: Utc::now(),
            source: String::new(),
            agent_id: None,
            data: Value::Null,
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach the agent only when known
    pub fn with_agent_opt(mut self, agent_id: Option<&str>) -> Self {
        self.agent_id = agent_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// String field from `data`
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Predefined events
// ============================================================================

pub mod system {
    use super::*;

    pub fn started(version: &str) -> SandboxEvent {
        SandboxEvent::new("system.started", EventCategory::System)
            .with_source("runtime")
            .with_data(serde_json::json!({ "version": version }))
    }

    pub fn shutdown(reason: &str) -> SandboxEvent {
        SandboxEvent::new("system.shutdown", EventCategory::System)
            .with_source("runtime")
            .with_data(serde_json::json!({ "reason": reason }))
    }
}

pub mod container {
    use super::*;

    pub fn created(
        container_id: &str,
        name: &str,
        runtime_id: &str,
        address: &str,
        agent_id: Option<&str>,
    ) -> SandboxEvent {
        SandboxEvent::new("container.created", EventCategory::Container)
            .with_source("container")
            .with_agent_opt(agent_id)
            .with_data(serde_json::json!({
                "container_id": container_id,
                "name": name,
                "runtime_id": runtime_id,
                "address": address,
            }))
    }

    pub fn destroyed(container_id: &str, name: &str, agent_id: Option<&str>) -> SandboxEvent {
        SandboxEvent::new("container.destroyed", EventCategory::Container)
            .with_source("container")
            .with_agent_opt(agent_id)
            .with_data(serde_json::json!({
                "container_id": container_id,
                "name": name,
            }))
    }

    pub fn failed(container_id: &str, error: &str, agent_id: Option<&str>) -> SandboxEvent {
        SandboxEvent::new("container.failed", EventCategory::Container)
            .with_severity(EventSeverity::Error)
            .with_source("container")
            .with_agent_opt(agent_id)
            .with_data(serde_json::json!({
                "container_id": container_id,
                "error": error,
            }))
    }
}

pub mod task {
    use super::*;

    pub fn started(
        task_id: &str,
        agent_id: &str,
        container_id: &str,
        kind: &str,
        description: &str,
    ) -> SandboxEvent {
        SandboxEvent::new("task.started", EventCategory::Task)
            .with_source("agent")
            .with_agent(agent_id)
            .with_data(serde_json::json!({
                "task_id": task_id,
                "container_id": container_id,
                "kind": kind,
                "description": description,
            }))
    }

    pub fn completed(
        task_id: &str,
        agent_id: &str,
        duration_ms: u64,
        command_count: usize,
    ) -> SandboxEvent {
        SandboxEvent::new("task.completed", EventCategory::Task)
            .with_source("agent")
            .with_agent(agent_id)
            .with_data(serde_json::json!({
                "task_id": task_id,
                "duration_ms": duration_ms,
                "command_count": command_count,
            }))
    }

    pub fn failed(task_id: &str, agent_id: &str, reason: &str, duration_ms: u64) -> SandboxEvent {
        SandboxEvent::new("task.failed", EventCategory::Task)
            .with_severity(EventSeverity::Error)
            .with_source("agent")
            .with_agent(agent_id)
            .with_data(serde_json::json!({
                "task_id": task_id,
                "reason": reason,
                "duration_ms": duration_ms,
            }))
    }

    /// One line of task progress output
    pub fn log(task_id: &str, agent_id: &str, line: &str) -> SandboxEvent {
        SandboxEvent::new("task.log", EventCategory::Task)
            .with_severity(EventSeverity::Debug)
            .with_source("agent")
            .with_agent(agent_id)
            .with_data(serde_json::json!({
                "task_id": task_id,
                "line": line,
            }))
    }
}

pub mod agent {
    use super::*;

    /// Partial status update; `patch` keys are merged by presenters
    pub fn status(agent_id: &str, patch: Value) -> SandboxEvent {
        SandboxEvent::new("agent.status", EventCategory::Agent)
            .with_source("agent")
            .with_agent(agent_id)
            .with_data(patch)
    }

    pub fn removed(agent_id: &str) -> SandboxEvent {
        SandboxEvent::new("agent.removed", EventCategory::Agent)
            .with_source("agent")
            .with_agent(agent_id)
    }
}
