//! Task-bound agent
//!
//! A `TaskAgent` binds each task it runs to a fresh container:
//!
//! ```text
//! execute_task(spec)
//!   ├─ create container (requirements → overrides)
//!   ├─ setup: git clone, editor tooling
//!   ├─ task commands (halt/timeout/deadline/cancel policy)
//!   ├─ cleanup: destroy container          ← always, once created
//!   └─ metrics + task.completed / task.failed
//! ```
//!
//! One agent may run several tasks concurrently; each gets its own container.

use crate::metrics::AgentMetrics;
use crate::task::{TaskId, TaskRecord, TaskReport, TaskSpec};
use crucible_container::{
    CommandObserver, CommandResult, CommandSpec, CommandStatus, ContainerId, ContainerManager,
    ContainerOverrides, ExecPolicy,
};
use crucible_foundation::event::{agent as agent_events, task as task_events};
use crucible_foundation::{Error, EventBus, Result, SandboxConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called with every report `execute_task` returns
pub type CompletionCallback = Arc<dyn Fn(&TaskReport) + Send + Sync>;

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: String,
    pub active_containers: usize,
    pub active_tasks: usize,
    pub metrics: AgentMetrics,
}

pub struct TaskAgent {
    id: String,
    manager: ContainerManager,
    bus: Arc<EventBus>,
    config: Arc<SandboxConfig>,
    metrics: Mutex<AgentMetrics>,
    containers: RwLock<HashSet<ContainerId>>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    cancel: Mutex<CancellationToken>,
    on_complete: Option<CompletionCallback>,
}

impl TaskAgent {
    pub fn new(manager: ContainerManager, bus: Arc<EventBus>, config: Arc<SandboxConfig>) -> Self {
        let id = format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let agent = Self {
            id,
            manager,
            bus,
            config,
            metrics: Mutex::new(AgentMetrics::new()),
            containers: RwLock::new(HashSet::new()),
            tasks: RwLock::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            on_complete: None,
        };
        agent.publish_status(json!({ "state": "idle" }));
        agent
    }

    pub fn with_completion_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskReport) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.lock().clone()
    }

    // ========================================================================
    // Task execution
    // ========================================================================

    /// Run one task in its own container
    ///
    /// Command failures are reported in the returned record. `Err` means the
    /// task could not run: invalid spec, container creation failure, or an
    /// engine failure mid-task (returned after cleanup).
    pub async fn execute_task(&self, spec: TaskSpec) -> Result<TaskReport> {
        spec.validate()?;

        let started = Instant::now();
        let cancel = self.cancel.lock().child_token();
        let deadline = spec
            .timeout()
            .or_else(|| self.config.execution.task_timeout())
            .and_then(|limit| tokio::time::Instant::now().checked_add(limit));

        let mut record = TaskRecord::new(spec, &self.id, self.config.agent.log_buffer_lines);
        let task_id = record.id;
        record.start();
        self.tasks.write().await.insert(task_id, record.clone());

        info!(
            agent_id = %self.id,
            task_id = %task_id,
            "Starting {} task: {}",
            record.spec.kind,
            record.spec.description
        );
        self.publish_status(json!({
            "state": "initializing",
            "task_id": task_id.to_string(),
            "description": record.spec.description,
        }));

        // Create
        let overrides = self.build_overrides(&record.spec, task_id);
        let created = {
            let create_cancel = cancel.child_token();
            let timer = deadline.map(|at| {
                let token = create_cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(at).await;
                    token.cancel();
                })
            });
            let created = self.manager.create_with(overrides, &create_cancel).await;
            if let Some(timer) = timer {
                timer.abort();
            }
            created
        };

        let created = match created {
            Err(Error::Cancelled) if deadline_reached(deadline) => Err(Error::Timeout(
                "task deadline exceeded during container creation".to_string(),
            )),
            other => other,
        };

        let instance = match created {
            Ok(instance) => instance,
            Err(e) => {
                warn!(agent_id = %self.id, task_id = %task_id, "Container creation failed: {}", e);
                self.teardown_half_started(task_id).await;
                record.pad_results("container creation failed");
                record.fail(format!("container creation failed: {}", e));
                self.record_failure(&record, started.elapsed());
                self.tasks.write().await.remove(&task_id);
                return Err(e);
            }
        };

        let container_id = instance.id;
        self.metrics.lock().record_container_created();
        self.containers.write().await.insert(container_id);
        record.container_id = Some(container_id);

        self.bus.publish(task_events::started(
            &task_id.to_string(),
            &self.id,
            &container_id.to_string(),
            record.spec.kind.as_str(),
            &record.spec.description,
        ));
        self.publish_status(json!({
            "state": "running",
            "container_id": container_id.to_string(),
            "address": instance.address,
        }));

        // Execute, then always clean up
        let observer: Arc<dyn CommandObserver> = Arc::new(TaskLogObserver {
            bus: self.bus.clone(),
            task_id: task_id.to_string(),
            agent_id: self.id.clone(),
        });
        let policy = ExecPolicy::from_settings(&self.config.execution)
            .with_deadline(deadline)
            .with_cancel(cancel.clone())
            .with_observer(observer);

        let outcome = self
            .execute_task_in_container(&mut record, container_id, &policy)
            .await;

        self.cleanup(container_id).await;

        if let Err(e) = outcome {
            warn!(agent_id = %self.id, task_id = %task_id, "Task aborted: {}", e);
            record.pad_results("task aborted");
            record.fail(e.to_string());
            self.record_failure(&record, started.elapsed());
            self.tasks.write().await.remove(&task_id);
            return Err(e);
        }

        let duration = started.elapsed();
        match failure_reason(&record, &policy) {
            Some(reason) => {
                record.fail(reason);
                self.record_failure(&record, duration);
            }
            None => {
                record.complete();
                self.metrics.lock().record_task_completed(duration);
                info!(agent_id = %self.id, task_id = %task_id, "Task completed in {:?}", duration);
                self.bus.publish(task_events::completed(
                    &task_id.to_string(),
                    &self.id,
                    duration.as_millis() as u64,
                    record.results.len(),
                ));
                self.publish_status(json!({
                    "state": "completed",
                    "task_id": task_id.to_string(),
                }));
            }
        }

        self.tasks.write().await.remove(&task_id);
        if let Some(callback) = &self.on_complete {
            callback(&record);
        }
        Ok(record)
    }

    /// Setup steps then the task's own commands
    ///
    /// If a setup step fails the task commands are reported as skipped.
    async fn execute_task_in_container(
        &self,
        record: &mut TaskRecord,
        container_id: ContainerId,
        policy: &ExecPolicy,
    ) -> Result<()> {
        let setup = self.setup_commands(&record.spec);
        if !setup.is_empty() {
            let setup_policy = policy.clone().with_halt_on_error(true);
            let results = self
                .manager
                .execute_commands(container_id, &setup, &setup_policy)
                .await?;
            log_results(record, &results);
            let failed = results.iter().any(|r| !r.success);
            record.setup_results = results;
            if failed {
                record.pad_results("setup failed");
                return Ok(());
            }
        }

        let commands: Vec<CommandSpec> = record
            .spec
            .commands
            .iter()
            .map(|c| CommandSpec::shell(c.as_str()))
            .collect();
        let results = self
            .manager
            .execute_commands(container_id, &commands, policy)
            .await?;
        log_results(record, &results);
        record.results = results;
        Ok(())
    }

    fn setup_commands(&self, spec: &TaskSpec) -> Vec<CommandSpec> {
        let mut setup = Vec::new();

        if let Some(url) = &spec.repository_url {
            setup.push(CommandSpec::exec([
                "git",
                "clone",
                "--",
                url.as_str(),
                self.config.container.working_dir.as_str(),
            ]));
        }

        if spec.needs_editor_tooling() && !self.config.agent.editor_packages.is_empty() {
            let mut argv = vec![
                "apt-get".to_string(),
                "install".to_string(),
                "-y".to_string(),
                "--no-install-recommends".to_string(),
            ];
            argv.extend(self.config.agent.editor_packages.iter().cloned());
            setup.push(CommandSpec::Exec(argv));
        }

        setup
    }

    fn build_overrides(&self, spec: &TaskSpec, task_id: TaskId) -> ContainerOverrides {
        let requirements = &spec.requirements;
        let mut overrides = ContainerOverrides::new()
            .with_owner(self.id.clone(), task_id.to_string())
            .with_label("crucible.agent", self.id.clone())
            .with_label("crucible.task", task_id.to_string());

        if let Some(language) = &requirements.language {
            match self.config.agent.image_for_language(language) {
                Some(image) => overrides = overrides.with_image(image),
                None => warn!(
                    agent_id = %self.id,
                    "No image configured for language '{}', using the default", language
                ),
            }
        }
        if let Some(memory) = &requirements.memory {
            overrides = overrides.with_memory(memory.clone());
        }
        if let Some(cpus) = &requirements.cpus {
            overrides = overrides.with_cpus(cpus.clone());
        }
        overrides
    }

    /// Tear down a container whose creation failed after the engine started it
    async fn teardown_half_started(&self, task_id: TaskId) {
        let task = task_id.to_string();
        let half_started = self.manager.list().await.into_iter().find(|i| {
            i.task_id.as_deref() == Some(task.as_str()) && i.runtime_id.is_some()
        });
        if let Some(instance) = half_started {
            debug!(
                agent_id = %self.id,
                container_id = %instance.id,
                "Removing half-started container"
            );
            if let Err(e) = self.manager.destroy(instance.id).await {
                warn!(
                    agent_id = %self.id,
                    container_id = %instance.id,
                    "Failed to remove half-started container: {}",
                    e
                );
            }
        }
    }

    fn record_failure(&self, record: &TaskRecord, duration: std::time::Duration) {
        let reason = record.failure_reason.clone().unwrap_or_default();
        self.metrics.lock().record_task_failed(duration);
        warn!(agent_id = %self.id, task_id = %record.id, "Task failed: {}", reason);
        self.bus.publish(task_events::failed(
            &record.id.to_string(),
            &self.id,
            &reason,
            duration.as_millis() as u64,
        ));
        self.publish_status(json!({
            "state": "failed",
            "task_id": record.id.to_string(),
            "error": reason,
        }));
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Destroy one container; failures are logged, never returned
    pub async fn cleanup(&self, container_id: ContainerId) -> bool {
        match self.manager.destroy(container_id).await {
            Ok(_) => {
                self.metrics.lock().record_container_destroyed();
                self.containers.write().await.remove(&container_id);
                true
            }
            Err(e) if e.is_not_found() => {
                self.containers.write().await.remove(&container_id);
                false
            }
            Err(e) => {
                warn!(agent_id = %self.id, container_id = %container_id, "Cleanup failed: {}", e);
                false
            }
        }
    }

    /// Destroy every container this agent still tracks
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<ContainerId> = self.containers.read().await.iter().copied().collect();
        let mut destroyed = 0;
        for id in ids {
            if self.cleanup(id).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Stop in-flight tasks at their next suspension point
    ///
    /// Tasks started afterwards run normally.
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
        info!(agent_id = %self.id, "Cancelled in-flight tasks");
    }

    /// Cancel, tear everything down and drop off the status presenters
    pub async fn retire(&self) {
        self.cancel_all();
        self.stop_all().await;
        self.bus.publish(agent_events::removed(&self.id));
    }

    pub async fn get_status(&self) -> AgentStatus {
        AgentStatus {
            id: self.id.clone(),
            active_containers: self.containers.read().await.len(),
            active_tasks: self.tasks.read().await.len(),
            metrics: self.metrics(),
        }
    }

    fn publish_status(&self, patch: Value) {
        self.bus.publish(agent_events::status(&self.id, patch));
    }
}

/// Why a finished task failed, `None` if it completed
fn deadline_reached(deadline: Option<tokio::time::Instant>) -> bool {
    deadline.map_or(false, |at| tokio::time::Instant::now() >= at)
}

fn failure_reason(record: &TaskRecord, policy: &ExecPolicy) -> Option<String> {
    let all: Vec<&CommandResult> = record
        .setup_results
        .iter()
        .chain(record.results.iter())
        .collect();
    let interrupted = all.iter().any(|r| {
        matches!(
            r.status,
            CommandStatus::Skipped | CommandStatus::Cancelled | CommandStatus::TimedOut
        )
    });

    if interrupted && policy.cancel.is_cancelled() {
        return Some("cancelled".to_string());
    }
    if interrupted && policy.deadline_passed() {
        return Some("deadline exceeded".to_string());
    }
    if let Some(step) = record.setup_results.iter().find(|r| !r.success) {
        return Some(format!("setup step `{}` {}", step.command, step.status));
    }

    let failed = record.failed_count();
    if failed > 0 {
        return Some(format!(
            "{} of {} commands failed",
            failed,
            record.results.len()
        ));
    }
    None
}

fn log_results(record: &mut TaskRecord, results: &[CommandResult]) {
    for result in results {
        record.logs.push_system(format!("$ {}", result.command));
        record.logs.push_output(&result.stdout, &result.stderr);
        if !result.success {
            record.logs.push_error(format!("{} ({:?})", result.status, result.exit_code));
        }
    }
}

/// Emits a `task.log` line per finished command
struct TaskLogObserver {
    bus: Arc<EventBus>,
    task_id: String,
    agent_id: String,
}

impl CommandObserver for TaskLogObserver {
    fn on_command_finished(&self, _index: usize, result: &CommandResult) {
        let line = match result.exit_code {
            Some(code) => format!("$ {} -> {} (exit {})", result.command, result.status, code),
            None => format!("$ {} -> {}", result.command, result.status),
        };
        self.bus
            .publish(task_events::log(&self.task_id, &self.agent_id, &line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TaskRequirements};
    use crucible_container::testing::RecordingEngine;
    use crucible_container::ManagerSettings;

    fn agent_with(config: SandboxConfig) -> (Arc<RecordingEngine>, TaskAgent) {
        let engine = Arc::new(RecordingEngine::new());
        let bus = Arc::new(EventBus::new());
        let settings = ManagerSettings::from(&config);
        let manager = ContainerManager::new(engine.clone(), bus.clone(), settings);
        (engine, TaskAgent::new(manager, bus, Arc::new(config)))
    }

    #[test]
    fn test_setup_commands() {
        let (_engine, agent) = agent_with(SandboxConfig::default());

        let plain = TaskSpec::new(TaskKind::Custom, "x");
        assert!(agent.setup_commands(&plain).is_empty());

        let spec = TaskSpec::new(TaskKind::RepositoryAnalysis, "x")
            .with_repository("https://github.com/example/project.git");
        let setup = agent.setup_commands(&spec);
        assert_eq!(setup.len(), 2);
        assert_eq!(
            setup[0].argv(),
            vec!["git", "clone", "--", "https://github.com/example/project.git", "/workspace"]
        );
        assert!(setup[1].argv().contains(&"ripgrep".to_string()));
    }

    #[test]
    fn test_overrides_follow_requirements() {
        let (_engine, agent) = agent_with(SandboxConfig::default());
        let spec = TaskSpec::new(TaskKind::Testing, "x").with_requirements(TaskRequirements {
            language: Some("Python".to_string()),
            memory: Some("4g".to_string()),
            cpus: Some("1.5".to_string()),
            ..TaskRequirements::default()
        });

        let task_id = TaskId::new();
        let overrides = agent.build_overrides(&spec, task_id);
        assert_eq!(overrides.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(overrides.memory.as_deref(), Some("4g"));
        assert_eq!(overrides.cpus.as_deref(), Some("1.5"));
        assert_eq!(overrides.owner.task_id, Some(task_id.to_string()));
        assert_eq!(overrides.owner.agent_id.as_deref(), Some(agent.id()));
    }

    #[test]
    fn test_unknown_language_keeps_default_image() {
        let (_engine, agent) = agent_with(SandboxConfig::default());
        let spec = TaskSpec::new(TaskKind::Custom, "x").with_requirements(TaskRequirements {
            language: Some("cobol".to_string()),
            ..TaskRequirements::default()
        });
        assert!(agent.build_overrides(&spec, TaskId::new()).image.is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_replaces_token() {
        let (_engine, agent) = agent_with(SandboxConfig::default());
        let before = agent.cancel.lock().clone();
        agent.cancel_all();
        assert!(before.is_cancelled());
        assert!(!agent.cancel.lock().is_cancelled());
    }
}
