//! Engine driven through the Docker / Podman command line
//!
//! Every invocation is an argument vector; nothing goes through a shell on
//! the host. Child processes are killed when their future is dropped, which
//! is how timeouts and cancellation in the manager reach the engine.

use super::{ContainerEngine, ContainerRuntime, EngineError, EngineResult, ExecOutput};
use crate::config::ContainerConfig;
use async_trait::async_trait;
use crucible_foundation::RuntimeSelection;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tracing::{debug, info};

/// Address template covering user-defined and default networks
const ADDRESS_FORMAT: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";

/// Older engines only expose the default bridge address here
const LEGACY_ADDRESS_FORMAT: &str = "{{.NetworkSettings.IPAddress}}";

#[derive(Debug, Clone)]
pub struct CliEngine {
    runtime: ContainerRuntime,
    binary: PathBuf,
}

impl CliEngine {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            binary: PathBuf::from(runtime.binary()),
        }
    }

    pub fn docker() -> Self {
        Self::new(ContainerRuntime::Docker)
    }

    pub fn podman() -> Self {
        Self::new(ContainerRuntime::Podman)
    }

    /// Locate a runtime binary on PATH
    ///
    /// `Auto` tries Docker first, then Podman.
    pub fn detect(selection: RuntimeSelection) -> EngineResult<Self> {
        let candidates: Vec<ContainerRuntime> = match selection {
            RuntimeSelection::Auto => ContainerRuntime::ALL.to_vec(),
            RuntimeSelection::Docker => vec![ContainerRuntime::Docker],
            RuntimeSelection::Podman => vec![ContainerRuntime::Podman],
        };

        for runtime in &candidates {
            if let Ok(binary) = which::which(runtime.binary()) {
                debug!("Found {} at {}", runtime, binary.display());
                return Ok(Self {
                    runtime: *runtime,
                    binary,
                });
            }
        }

        let names: Vec<&str> = candidates.iter().map(|r| r.binary()).collect();
        Err(EngineError::NotInstalled(format!(
            "none of [{}] found on PATH",
            names.join(", ")
        )))
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn invoke(&self, operation: &str, args: &[String]) -> EngineResult<Output> {
        debug!(engine = %self.runtime, operation, "{:?}", args);

        tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                operation: operation.to_string(),
                source,
            })
    }

    /// Invoke and require a zero exit status
    async fn invoke_ok(
        &self,
        operation: &str,
        args: &[String],
        target: &str,
    ) -> EngineResult<String> {
        let output = self.invoke(operation, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(failure(operation, target, &output))
    }

    async fn inspect_format(&self, runtime_id: &str, format: &str) -> EngineResult<String> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            format.to_string(),
            runtime_id.to_string(),
        ];
        let stdout = self.invoke_ok("inspect", &args, runtime_id).await?;
        Ok(stdout.trim().to_string())
    }
}

fn failure(operation: &str, target: &str, output: &Output) -> EngineError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_ascii_lowercase().contains("no such container") {
        return EngineError::NoSuchContainer(target.to_string());
    }
    EngineError::CommandFailed {
        operation: operation.to_string(),
        code: output.status.code(),
        stderr,
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn name(&self) -> &str {
        self.runtime.binary()
    }

    async fn is_available(&self) -> bool {
        self.invoke("info", &["info".to_string()])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, config: &ContainerConfig) -> EngineResult<String> {
        info!(
            "Starting container {} from {} with {}",
            config.name, config.image, self.runtime
        );

        let args = config.build_run_args();
        let stdout = self.invoke_ok("run", &args, &config.name).await?;

        let runtime_id = stdout.trim().lines().last().unwrap_or_default().trim().to_string();
        if runtime_id.is_empty() {
            return Err(EngineError::Unexpected {
                operation: "run".to_string(),
                message: "engine returned no container id".to_string(),
            });
        }
        Ok(runtime_id)
    }

    async fn exec(
        &self,
        runtime_id: &str,
        argv: &[String],
        working_dir: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        let mut args = vec!["exec".to_string()];
        if let Some(dir) = working_dir {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.push(runtime_id.to_string());
        args.extend(argv.iter().cloned());

        let output = self.invoke("exec", &args).await?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() && stderr.to_ascii_lowercase().contains("no such container") {
            return Err(EngineError::NoSuchContainer(runtime_id.to_string()));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }

    async fn inspect_address(&self, runtime_id: &str) -> EngineResult<String> {
        let address = self.inspect_format(runtime_id, ADDRESS_FORMAT).await?;
        if !address.is_empty() {
            return Ok(address);
        }
        self.inspect_format(runtime_id, LEGACY_ADDRESS_FORMAT).await
    }

    async fn logs(&self, runtime_id: &str) -> EngineResult<Vec<String>> {
        let args = vec!["logs".to_string(), runtime_id.to_string()];
        let output = self.invoke("logs", &args).await?;
        if !output.status.success() {
            return Err(failure("logs", runtime_id, &output));
        }

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect();
        lines.extend(String::from_utf8_lossy(&output.stderr).lines().map(String::from));
        Ok(lines)
    }

    async fn stop(&self, runtime_id: &str, timeout: Duration) -> EngineResult<()> {
        info!("Stopping container: {}", runtime_id);
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            runtime_id.to_string(),
        ];
        self.invoke_ok("stop", &args, runtime_id).await.map(|_| ())
    }

    async fn remove(&self, runtime_id: &str) -> EngineResult<()> {
        info!("Removing container: {}", runtime_id);
        let args = vec!["rm".to_string(), "-f".to_string(), runtime_id.to_string()];
        self.invoke_ok("rm", &args, runtime_id).await.map(|_| ())
    }
}
