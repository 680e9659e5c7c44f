//! Container Lifecycle Manager
//!
//! Creates, tracks and destroys containers, and runs command sequences inside
//! them. It knows nothing about tasks: an instance may carry owner ids for
//! reporting, nothing more.
//!
//! ```text
//! create ──► [creating] ──run/inspect/bootstrap──► [running] ──destroy──► (gone)
//!                 │                                    │
//!                 └──────────── failure ──────────► [error] (stays registered)
//! ```
//!
//! The registry lock is never held across an engine call.

use crate::command::{CommandResult, CommandSpec, CommandStatus, ExecPolicy};
use crate::config::{ContainerConfig, ContainerId, ContainerOverrides};
use crate::engine::{ContainerEngine, EngineError, EngineResult};
use crate::instance::ContainerInstance;
use crucible_foundation::event::container as container_events;
use crucible_foundation::{ContainerDefaults, Error, EventBus, Result, SandboxConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Headroom on top of the engine's own stop grace period
const STOP_SLACK: Duration = Duration::from_secs(30);

/// Address reported when the engine resolves none
const FALLBACK_ADDRESS: &str = "localhost";

/// Settings the manager takes from `SandboxConfig`
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub defaults: ContainerDefaults,
    pub stop_timeout: Duration,
    /// Limit for each bootstrap exec; `None` waits indefinitely
    pub bootstrap_timeout: Option<Duration>,
    pub log_buffer_lines: usize,
}

impl From<&SandboxConfig> for ManagerSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            defaults: config.container.clone(),
            stop_timeout: config.engine.stop_timeout(),
            bootstrap_timeout: config.execution.command_timeout(),
            log_buffer_lines: config.agent.log_buffer_lines,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

#[derive(Clone)]
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    bus: Arc<EventBus>,
    settings: Arc<ManagerSettings>,
    containers: Arc<RwLock<HashMap<ContainerId, ContainerInstance>>>,
}

impl ContainerManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: Arc<EventBus>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            engine,
            bus,
            settings: Arc::new(settings),
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ========================================================================
    // Create
    // ========================================================================

    pub async fn create(&self, overrides: ContainerOverrides) -> Result<ContainerInstance> {
        self.create_with(overrides, &CancellationToken::new()).await
    }

    /// Create a container, aborting engine work when `cancel` fires
    ///
    /// On failure the instance stays registered in status `error`.
    pub async fn create_with(
        &self,
        overrides: ContainerOverrides,
        cancel: &CancellationToken,
    ) -> Result<ContainerInstance> {
        let owner = overrides.owner.clone();
        let config = ContainerConfig::resolve(&self.settings.defaults, overrides)?;
        let id = config.id;

        let mut instance = ContainerInstance::new(config.clone(), self.settings.log_buffer_lines);
        instance.agent_id = owner.agent_id.clone();
        instance.task_id = owner.task_id.clone();
        instance
            .logs
            .push_system(format!("Creating container {} from {}", config.name, config.image));
        self.containers.write().await.insert(id, instance);

        info!(container_id = %id, "Creating container {} ({})", config.name, config.image);

        match self.start(&config, cancel).await {
            Ok(address) => {
                let snapshot = self
                    .update(id, |instance| instance.mark_running(address.clone()))
                    .await?;
                let runtime_id = snapshot.runtime_id.clone().unwrap_or_default();

                info!(container_id = %id, "Container {} running at {}", config.name, address);
                self.bus.publish(container_events::created(
                    &id.to_string(),
                    &config.name,
                    &runtime_id,
                    &address,
                    owner.agent_id.as_deref(),
                ));
                Ok(snapshot)
            }
            Err(e) => {
                error!(container_id = %id, "Failed to create container {}: {}", config.name, e);
                let message = format!("create failed: {}", e);
                // Registered above; only a concurrent destroy could have removed it
                let _ = self.update(id, |instance| instance.mark_error(message)).await;
                self.bus.publish(container_events::failed(
                    &id.to_string(),
                    &e.to_string(),
                    owner.agent_id.as_deref(),
                ));
                Err(e)
            }
        }
    }

    /// Run, resolve the address, bootstrap; returns the address
    async fn start(&self, config: &ContainerConfig, cancel: &CancellationToken) -> Result<String> {
        let id = config.id;

        let runtime_id = guarded("run", self.engine.run(config), None, cancel).await?;
        let recorded = runtime_id.clone();
        self.update(id, move |instance| instance.runtime_id = Some(recorded))
            .await?;
        debug!(container_id = %id, "Engine id {}", runtime_id);

        let address = guarded("inspect", self.engine.inspect_address(&runtime_id), None, cancel)
            .await?;
        let address = if address.is_empty() {
            FALLBACK_ADDRESS.to_string()
        } else {
            address
        };

        for script in &self.settings.defaults.bootstrap {
            self.bootstrap_step(id, &runtime_id, &CommandSpec::shell(script.as_str()), cancel)
                .await?;
        }
        let mkdir = CommandSpec::exec(["mkdir", "-p", config.working_dir.as_str()]);
        self.bootstrap_step(id, &runtime_id, &mkdir, cancel).await?;

        Ok(address)
    }

    async fn bootstrap_step(
        &self,
        id: ContainerId,
        runtime_id: &str,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(container_id = %id, "Bootstrap: {}", command);
        let argv = command.argv();
        let exec = self.engine.exec(runtime_id, &argv, None);
        let output = guarded("exec", exec, self.settings.bootstrap_timeout, cancel).await?;

        let (stdout, stderr) = (output.stdout.clone(), output.stderr.clone());
        let _ = self
            .update(id, move |instance| instance.logs.push_output(&stdout, &stderr))
            .await;

        if output.success() {
            Ok(())
        } else {
            Err(Error::engine(
                "bootstrap",
                format!(
                    "`{}` exited with {}: {}",
                    command,
                    output.exit_code,
                    output.stderr.trim()
                ),
            ))
        }
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Run `commands` in order inside a running container
    ///
    /// Returns exactly one result per command. A failing, timed-out or
    /// cancelled command is data; commands not attempted because of
    /// `halt_on_error`, the deadline or cancellation are `skipped`. Errors
    /// are returned only when the container cannot be used at all.
    pub async fn execute_commands(
        &self,
        id: ContainerId,
        commands: &[CommandSpec],
        policy: &ExecPolicy,
    ) -> Result<Vec<CommandResult>> {
        let (runtime_id, working_dir) = {
            let containers = self.containers.read().await;
            let instance = containers
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
            if !instance.is_running() {
                return Err(Error::InvalidState(format!(
                    "container {} is {}",
                    id, instance.status
                )));
            }
            let runtime_id = instance.runtime_id.clone().ok_or_else(|| {
                Error::InvalidState(format!("container {} has no engine id", id))
            })?;
            (runtime_id, instance.config.working_dir.clone())
        };

        for command in commands {
            command.validate()?;
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut halted: Option<&'static str> = None;

        for (index, command) in commands.iter().enumerate() {
            if halted.is_none() {
                if policy.cancel.is_cancelled() {
                    halted = Some("cancelled");
                } else if policy.deadline_passed() {
                    halted = Some("deadline exceeded");
                }
            }

            let result = match halted {
                Some(reason) => CommandResult::skipped(command, reason),
                None => {
                    let result = self
                        .run_command(id, &runtime_id, &working_dir, command, policy)
                        .await?;
                    halted = match result.status {
                        CommandStatus::Succeeded => None,
                        CommandStatus::Cancelled => Some("cancelled"),
                        CommandStatus::TimedOut if policy.deadline_passed() => {
                            Some("deadline exceeded")
                        }
                        _ if policy.halt_on_error => Some("halted after failure"),
                        _ => None,
                    };
                    result
                }
            };

            if let Some(observer) = &policy.observer {
                observer.on_command_finished(index, &result);
            }
            results.push(result);
        }

        Ok(results)
    }

    async fn run_command(
        &self,
        id: ContainerId,
        runtime_id: &str,
        working_dir: &str,
        command: &CommandSpec,
        policy: &ExecPolicy,
    ) -> Result<CommandResult> {
        debug!(container_id = %id, "Exec: {}", command);
        let started = Instant::now();
        let argv = command.argv();

        let exec = self.engine.exec(runtime_id, &argv, Some(working_dir));
        let result = match guarded("exec", exec, policy.budget(), &policy.cancel).await {
            Ok(output) => CommandResult::completed(
                command,
                output.stdout,
                output.stderr,
                output.exit_code,
                started.elapsed(),
            ),
            Err(EngineError::Timeout { after, .. }) => {
                warn!(container_id = %id, "Command timed out after {:?}: {}", after, command);
                CommandResult::timed_out(command, after)
            }
            Err(EngineError::Cancelled(_)) => CommandResult::cancelled(command, started.elapsed()),
            Err(e) => return Err(e.into()),
        };

        let logged = result.clone();
        let _ = self
            .update(id, move |instance| {
                instance.logs.push_system(format!("$ {}", logged.command));
                instance.logs.push_output(&logged.stdout, &logged.stderr);
                if !logged.success {
                    instance
                        .logs
                        .push_error(format!("{} ({:?})", logged.status, logged.exit_code));
                }
            })
            .await;

        Ok(result)
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Stop and remove a container, then drop it from the registry
    ///
    /// Not idempotent: a second call fails with not-found. On engine failure
    /// the instance is marked `error` and kept.
    pub async fn destroy(&self, id: ContainerId) -> Result<ContainerInstance> {
        let (runtime_id, auto_remove, name, agent_id) = {
            let containers = self.containers.read().await;
            let instance = containers
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
            (
                instance.runtime_id.clone(),
                instance.config.auto_remove,
                instance.config.name.clone(),
                instance.agent_id.clone(),
            )
        };

        if let Some(runtime_id) = runtime_id {
            if let Err(e) = self.teardown(id, &runtime_id, auto_remove).await {
                warn!(container_id = %id, "Failed to destroy container {}: {}", name, e);
                let message = format!("destroy failed: {}", e);
                let _ = self.update(id, |instance| instance.mark_error(message)).await;
                return Err(e.into());
            }
        }

        let mut instance = self
            .containers
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
        instance.mark_destroyed();

        info!(container_id = %id, "Destroyed container {}", name);
        self.bus.publish(container_events::destroyed(
            &id.to_string(),
            &name,
            agent_id.as_deref(),
        ));
        Ok(instance)
    }

    /// Engine-side teardown; a container the engine no longer knows is gone
    async fn teardown(
        &self,
        id: ContainerId,
        runtime_id: &str,
        auto_remove: bool,
    ) -> EngineResult<()> {
        let never = CancellationToken::new();
        let grace = self.settings.stop_timeout;
        let limit = Some(grace + STOP_SLACK);

        match guarded("stop", self.engine.stop(runtime_id, grace), limit, &never).await {
            Ok(()) => {}
            Err(e) if e.is_no_such_container() => {
                debug!(container_id = %id, "Container already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let _ = self.update(id, |instance| instance.mark_stopped()).await;

        // The engine deletes auto-remove containers on stop
        if auto_remove {
            return Ok(());
        }

        match guarded("rm", self.engine.remove(runtime_id), limit, &never).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_such_container() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort teardown of every registered container
    ///
    /// Returns how many were destroyed; failures are logged.
    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<ContainerId> = self.containers.read().await.keys().copied().collect();
        if ids.is_empty() {
            return 0;
        }
        info!("Destroying {} container(s)", ids.len());

        let outcomes = futures::future::join_all(ids.into_iter().map(|id| async move {
            (id, self.destroy(id).await)
        }))
        .await;

        let mut destroyed = 0;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => destroyed += 1,
                Err(e) => warn!(container_id = %id, "Teardown failed: {}", e),
            }
        }
        destroyed
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Engine log stream, falling back to the local buffer
    pub async fn get_logs(&self, id: ContainerId) -> Result<Vec<String>> {
        let (runtime_id, buffered) = {
            let containers = self.containers.read().await;
            let instance = containers
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
            (instance.runtime_id.clone(), instance.logs.lines())
        };

        let Some(runtime_id) = runtime_id else {
            return Ok(buffered);
        };
        match self.engine.logs(&runtime_id).await {
            Ok(lines) => Ok(lines),
            Err(e) => {
                debug!(container_id = %id, "Live logs unavailable ({}), using buffer", e);
                Ok(buffered)
            }
        }
    }

    pub async fn list(&self) -> Vec<ContainerInstance> {
        let mut instances: Vec<ContainerInstance> =
            self.containers.read().await.values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }

    pub async fn get(&self, id: ContainerId) -> Option<ContainerInstance> {
        self.containers.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.containers.read().await.len()
    }

    /// Mutate a registered instance and return a snapshot of it
    async fn update<F>(&self, id: ContainerId, f: F) -> Result<ContainerInstance>
    where
        F: FnOnce(&mut ContainerInstance),
    {
        let mut containers = self.containers.write().await;
        let instance = containers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
        f(instance);
        Ok(instance.clone())
    }
}

/// Race an engine call against an optional time limit and a cancel token
///
/// Losing the race drops the engine future, which kills its child process.
async fn guarded<T, F>(
    operation: &str,
    call: F,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    let timed = async {
        match limit {
            Some(after) => match tokio::time::timeout(after, call).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    operation: operation.to_string(),
                    after,
                }),
            },
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled(operation.to_string())),
        result = timed => result,
    }
}
