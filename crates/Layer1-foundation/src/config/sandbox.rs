//! Sandbox Config - unified runtime configuration
//!
//! Every field has a default, so an empty file (or no file at all) yields the
//! baseline: `ubuntu:22.04`, 2g memory, 2 CPUs, ports 8080 and 3000 published on
//! engine-assigned host ports,
//! `/workspace` as the working directory.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::store::ConfigStore;

/// Config file name
pub const SANDBOX_CONFIG_FILE: &str = "config.toml";

/// Environment variable selecting the container runtime
pub const ENV_ENGINE: &str = "CRUCIBLE_ENGINE";

/// Environment variable overriding the default image
pub const ENV_IMAGE: &str = "CRUCIBLE_IMAGE";

// ============================================================================
// Sandbox Config
// ============================================================================

/// Crucible configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container engine selection
    pub engine: EngineSettings,

    /// Defaults merged under every container request
    pub container: ContainerDefaults,

    /// Command execution policy
    pub execution: ExecutionSettings,

    /// Task agent behaviour
    pub agent: AgentSettings,

    /// Event bus sizing
    pub events: EventSettings,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Global + project merged load, then environment overrides
    pub fn load() -> Result<Self> {
        let mut stores = Vec::new();
        if let Ok(global) = ConfigStore::global() {
            stores.push(global);
        }
        if let Ok(project) = ConfigStore::current_project() {
            stores.push(project);
        }

        let mut merged = toml::Table::new();
        for store in &stores {
            if let Some(table) = store.load_table(SANDBOX_CONFIG_FILE)? {
                merge_tables(&mut merged, table);
            }
        }

        let mut config: SandboxConfig = toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a single file; missing keys take their defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `CRUCIBLE_ENGINE` / `CRUCIBLE_IMAGE`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(engine) = std::env::var(ENV_ENGINE) {
            match engine.parse::<RuntimeSelection>() {
                Ok(selection) => self.engine.runtime = selection,
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_ENGINE, e),
            }
        }
        if let Ok(image) = std::env::var(ENV_IMAGE) {
            if !image.trim().is_empty() {
                self.container.image = image;
            }
        }
    }

    /// Reject values that cannot produce a working container
    pub fn validate(&self) -> Result<()> {
        if self.container.image.trim().is_empty() {
            return Err(Error::Config("container.image must not be empty".into()));
        }
        if !self.container.working_dir.starts_with('/') {
            return Err(Error::Config(format!(
                "container.working_dir must be absolute, got '{}'",
                self.container.working_dir
            )));
        }
        if self.events.channel_capacity == 0 {
            return Err(Error::Config("events.channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Which container CLI to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeSelection {
    /// Probe `docker`, then `podman`
    #[default]
    Auto,
    Docker,
    Podman,
}

impl std::str::FromStr for RuntimeSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(Error::Config(format!("unknown container runtime '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub runtime: RuntimeSelection,

    /// Grace period handed to `stop -t`
    pub stop_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            runtime: RuntimeSelection::Auto,
            stop_timeout_secs: 10,
        }
    }
}

impl EngineSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

// ============================================================================
// Container defaults
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefaults {
    pub image: String,

    /// Memory limit (e.g. "512m", "2g")
    pub memory: String,

    /// CPU share passed to `--cpus`
    pub cpus: String,

    /// Port mappings, `host:container`
    pub ports: Vec<String>,

    pub env: BTreeMap<String, String>,

    pub working_dir: String,

    /// Let the engine delete the container once it stops
    pub auto_remove: bool,

    pub labels: BTreeMap<String, String>,

    /// Shell commands run once after start, before the working directory is created
    pub bootstrap: Vec<String>,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "crucible".to_string());

        Self {
            image: "ubuntu:22.04".to_string(),
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            // Container side only; the engine picks free host ports
            ports: vec!["8080".to_string(), "3000".to_string()],
            env,
            working_dir: "/workspace".to_string(),
            auto_remove: false,
            labels,
            bootstrap: vec![
                "apt-get update".to_string(),
                "apt-get install -y --no-install-recommends git curl wget ca-certificates procps"
                    .to_string(),
            ],
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Stop a command sequence at the first failing command
    pub halt_on_error: bool,

    /// Per-command limit in seconds, 0 disables
    pub command_timeout_secs: u64,

    /// Whole-task limit in seconds, 0 disables
    pub task_timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            halt_on_error: false,
            command_timeout_secs: 600,
            task_timeout_secs: 3600,
        }
    }
}

impl ExecutionSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.command_timeout_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.task_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Rolling log buffer size for containers and tasks
    pub log_buffer_lines: usize,

    /// Packages installed when a task needs editor tooling
    pub editor_packages: Vec<String>,

    /// Image used when a task asks for a language runtime
    pub language_images: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let language_images = [
            ("node", "node:20-slim"),
            ("python", "python:3.12-slim"),
            ("rust", "rust:1.75-slim"),
            ("go", "golang:1.22"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            log_buffer_lines: 1000,
            editor_packages: vec![
                "vim".to_string(),
                "less".to_string(),
                "ripgrep".to_string(),
                "tree".to_string(),
            ],
            language_images,
        }
    }
}

impl AgentSettings {
    /// Image for a language runtime, matched case-insensitively
    pub fn image_for_language(&self, language: &str) -> Option<&str> {
        let wanted = language.trim().to_ascii_lowercase();
        self.language_images
            .iter()
            .find(|(name, _)| name.to_ascii_lowercase() == wanted)
            .map(|(_, image)| image.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub channel_capacity: usize,
    pub history_size: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 100,
        }
    }
}
