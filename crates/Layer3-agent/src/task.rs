//! Task model
//!
//! A `TaskSpec` is what a caller asks for; a `TaskRecord` is what happened.
//! Task specs are read from JSON or TOML files:
//!
//! ```toml
//! kind = "testing"
//! description = "Run the test suite"
//! repository_url = "https://github.com/example/project.git"
//! commands = ["cargo test --all"]
//!
//! [requirements]
//! language = "rust"
//! memory = "4g"
//! ```

use crucible_container::{validate, CommandResult, CommandSpec, ContainerId, LogBuffer};
use crucible_foundation::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// TaskId
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TaskSpec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    RepositoryAnalysis,
    CodeGeneration,
    Testing,
    Deployment,
    Custom,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RepositoryAnalysis => "repository-analysis",
            TaskKind::CodeGeneration => "code-generation",
            TaskKind::Testing => "testing",
            TaskKind::Deployment => "deployment",
            TaskKind::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "repository-analysis" => Ok(TaskKind::RepositoryAnalysis),
            "code-generation" => Ok(TaskKind::CodeGeneration),
            "testing" => Ok(TaskKind::Testing),
            "deployment" => Ok(TaskKind::Deployment),
            "custom" => Ok(TaskKind::Custom),
            other => Err(Error::Validation(format!("unknown task kind '{}'", other))),
        }
    }
}

/// Resources and tooling a task needs from its container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    /// Install editor tooling regardless of task kind
    pub editor_tooling: bool,
    /// Language runtime; selects the container image
    pub language: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    /// Shell commands, run in order in the working directory
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub requirements: TaskRequirements,
    /// Overrides `execution.task_timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            repository_url: None,
            commands: Vec::new(),
            requirements: TaskRequirements::default(),
            timeout_secs: None,
        }
    }

    pub fn with_repository(mut self, url: impl Into<String>) -> Self {
        self.repository_url = Some(url.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let spec: Self = toml::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read a task file; `.toml` is TOML, anything else JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Reject anything that must not reach the engine
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.repository_url {
            validate::repository_url(url)?;
        }
        for (index, command) in self.commands.iter().enumerate() {
            if command.trim().is_empty() {
                return Err(Error::Validation(format!("command {} is empty", index + 1)));
            }
            if command.contains('\0') {
                return Err(Error::Validation(format!(
                    "command {} contains a NUL byte",
                    index + 1
                )));
            }
        }
        if let Some(memory) = &self.requirements.memory {
            validate::memory(memory)?;
        }
        if let Some(cpus) = &self.requirements.cpus {
            validate::cpus(cpus)?;
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::Validation("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Whether editor tooling is provisioned before the commands run
    pub fn needs_editor_tooling(&self) -> bool {
        self.kind == TaskKind::RepositoryAnalysis || self.requirements.editor_tooling
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

// ============================================================================
// TaskRecord
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One task run, bound to the container it ran in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub agent_id: String,
    pub spec: TaskSpec,
    pub container_id: Option<ContainerId>,
    pub status: TaskStatus,
    /// One entry per `spec.commands` entry once the task has finished
    pub results: Vec<CommandResult>,
    /// Clone and tooling steps run before the commands
    pub setup_results: Vec<CommandResult>,
    pub logs: LogBuffer,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// What `execute_task` hands back
pub type TaskReport = TaskRecord;

impl TaskRecord {
    pub fn new(spec: TaskSpec, agent_id: impl Into<String>, log_lines: usize) -> Self {
        Self {
            id: TaskId::new(),
            agent_id: agent_id.into(),
            spec,
            container_id: None,
            status: TaskStatus::Pending,
            results: Vec::new(),
            setup_results: Vec::new(),
            logs: LogBuffer::new(log_lines),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.logs
            .push_system(format!("Task started: {}", self.spec.description));
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.logs.push_system("Task completed");
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status = TaskStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.logs.push_error(format!("Task failed: {}", reason));
        self.failure_reason = Some(reason);
    }

    /// Fill `results` up to one per command with skipped entries
    pub fn pad_results(&mut self, reason: &str) {
        let done = self.results.len();
        for command in self.spec.commands.iter().skip(done) {
            self.results
                .push(CommandResult::skipped(&CommandSpec::shell(command.as_str()), reason));
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// Wall time from start to end (or now, while running)
    pub fn duration(&self) -> Duration {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_json() {
        let spec = TaskSpec::from_json_str(
            r#"{
                "kind": "repository-analysis",
                "description": "Look around",
                "repository_url": "https://github.com/example/project.git",
                "commands": ["ls -la", "wc -l README.md"],
                "requirements": { "language": "python", "memory": "1g" }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.kind, TaskKind::RepositoryAnalysis);
        assert_eq!(spec.commands.len(), 2);
        assert_eq!(spec.requirements.language.as_deref(), Some("python"));
        assert!(spec.needs_editor_tooling());
        assert_eq!(spec.timeout(), None);
    }

    #[test]
    fn test_spec_from_toml() {
        let spec = TaskSpec::from_toml_str(
            r#"
kind = "custom"
description = "One-off"
commands = ["exit 1"]
timeout_secs = 30

[requirements]
editor_tooling = true
"#,
        )
        .unwrap();

        assert_eq!(spec.kind, TaskKind::Custom);
        assert!(spec.needs_editor_tooling());
        assert_eq!(spec.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_spec_rejects_bad_input() {
        let injected = TaskSpec::new(TaskKind::Custom, "x").with_repository("--upload-pack=evil");
        assert!(matches!(injected.validate(), Err(Error::Validation(_))));

        let scheme = TaskSpec::new(TaskKind::Custom, "x").with_repository("file:///etc/passwd");
        assert!(scheme.validate().is_err());

        let empty = TaskSpec::new(TaskKind::Custom, "x").with_command("  ");
        assert!(empty.validate().is_err());

        let memory = TaskSpec::new(TaskKind::Custom, "x").with_requirements(TaskRequirements {
            memory: Some("plenty".to_string()),
            ..TaskRequirements::default()
        });
        assert!(memory.validate().is_err());

        assert!(TaskSpec::from_json_str(r#"{"kind": "chat", "description": "x"}"#).is_err());
    }

    #[test]
    fn test_spec_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("task.json");
        std::fs::write(&json, r#"{"kind": "testing", "description": "t", "commands": ["true"]}"#)
            .unwrap();
        let toml_path = dir.path().join("task.toml");
        std::fs::write(&toml_path, "kind = \"deployment\"\ndescription = \"d\"\n").unwrap();

        assert_eq!(TaskSpec::load(&json).unwrap().kind, TaskKind::Testing);
        assert_eq!(TaskSpec::load(&toml_path).unwrap().kind, TaskKind::Deployment);
    }

    #[test]
    fn test_record_lifecycle() {
        let spec = TaskSpec::new(TaskKind::Custom, "pad").with_commands(["a", "b", "c"]);
        let mut record = TaskRecord::new(spec, "agent-1", 100);
        assert_eq!(record.status, TaskStatus::Pending);

        record.start();
        record.pad_results("container creation failed");
        record.fail("container creation failed");

        assert_eq!(record.results.len(), 3);
        assert!(record.results.iter().all(|r| r.is_skipped()));
        assert_eq!(record.results[1].command, "b");
        assert!(record.status.is_terminal());
        assert!(record.ended_at.is_some());
        assert_eq!(record.failed_count(), 3);
    }

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            TaskKind::RepositoryAnalysis,
            TaskKind::CodeGeneration,
            TaskKind::Testing,
            TaskKind::Deployment,
            TaskKind::Custom,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }
}
