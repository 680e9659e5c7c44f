//! Container configuration
//!
//! `ContainerOverrides` is what callers supply; `ContainerConfig::resolve`
//! merges it onto the configured defaults, mints an identity and validates
//! the result. A resolved config is never mutated afterwards.

use crate::validate;
use crucible_foundation::{ContainerDefaults, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Process the container runs so that it never exits on its own
pub const KEEP_ALIVE_COMMAND: &[&str] = &["sleep", "infinity"];

/// Label carrying the container's Crucible identity
pub const ID_LABEL: &str = "crucible.id";

// ============================================================================
// ContainerId
// ============================================================================

/// Identity minted by the manager for every `create`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub Uuid);

impl ContainerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex chars, used in generated names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Ports / volumes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// `host:container[/proto]` or just `container[/proto]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: Option<u16>,
    pub container: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self {
            host: Some(host),
            container,
            protocol: Protocol::Tcp,
        }
    }

    /// Value for `-p`
    pub fn to_arg(&self) -> String {
        let proto = match self.protocol {
            Protocol::Tcp => "",
            Protocol::Udp => "/udp",
        };
        match self.host {
            Some(host) => format!("{}:{}{}", host, self.container, proto),
            None => format!("{}{}", self.container, proto),
        }
    }
}

impl FromStr for PortMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid port mapping '{}'", s));
        let parse_port = |p: &str| -> Result<u16> {
            match p.parse::<u16>() {
                Ok(port) if port > 0 => Ok(port),
                _ => Err(invalid()),
            }
        };

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };

        let (host, container) = match ports.split_once(':') {
            Some((host, container)) => (Some(parse_port(host)?), parse_port(container)?),
            None => (None, parse_port(ports)?),
        };

        Ok(Self {
            host,
            container,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_arg())
    }
}

/// Bind mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Value for `-v`
    pub fn to_arg(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host_path, self.container_path, ro)
    }

    fn validate(&self) -> Result<()> {
        if !self.host_path.starts_with('/') || self.host_path.contains(':') {
            return Err(Error::Validation(format!(
                "volume host path must be absolute: '{}'",
                self.host_path
            )));
        }
        validate::container_path(&self.container_path)
    }
}

// ============================================================================
// Overrides
// ============================================================================

/// Who a container belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOwner {
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
}

/// Caller-supplied partial configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOverrides {
    pub name: Option<String>,
    pub image: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    /// Replaces the default port set when present
    pub ports: Option<Vec<PortMapping>>,
    pub volumes: Vec<VolumeMount>,
    /// Merged over the default environment
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub auto_remove: Option<bool>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub owner: ContainerOwner,
}

impl ContainerOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn with_cpus(mut self, cpus: impl Into<String>) -> Self {
        self.cpus = Some(cpus.into());
        self
    }

    pub fn with_ports(mut self, ports: Vec<PortMapping>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = Some(auto_remove);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, agent_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        self.owner = ContainerOwner {
            agent_id: Some(agent_id.into()),
            task_id: Some(task_id.into()),
        };
        self
    }
}

// ============================================================================
// ContainerConfig
// ============================================================================

/// Fully resolved container configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub auto_remove: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Merge `overrides` onto `defaults`, mint an identity, validate
    pub fn resolve(defaults: &ContainerDefaults, overrides: ContainerOverrides) -> Result<Self> {
        let id = ContainerId::new();

        let ports = match overrides.ports {
            Some(ports) => ports,
            None => defaults
                .ports
                .iter()
                .map(|p| p.parse())
                .collect::<Result<Vec<PortMapping>>>()?,
        };

        let mut env = defaults.env.clone();
        env.extend(overrides.env);

        let mut labels = defaults.labels.clone();
        labels.extend(overrides.labels);
        labels.insert(ID_LABEL.to_string(), id.to_string());

        let config = Self {
            id,
            name: overrides
                .name
                .unwrap_or_else(|| format!("crucible-{}", id.short())),
            image: overrides.image.unwrap_or_else(|| defaults.image.clone()),
            memory: overrides.memory.unwrap_or_else(|| defaults.memory.clone()),
            cpus: overrides.cpus.unwrap_or_else(|| defaults.cpus.clone()),
            ports,
            volumes: overrides.volumes,
            env,
            working_dir: overrides
                .working_dir
                .unwrap_or_else(|| defaults.working_dir.clone()),
            auto_remove: overrides.auto_remove.unwrap_or(defaults.auto_remove),
            labels,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate::container_name(&self.name)?;
        validate::image(&self.image)?;
        validate::memory(&self.memory)?;
        validate::cpus(&self.cpus)?;
        validate::container_path(&self.working_dir)?;
        for (key, value) in &self.env {
            validate::env_var(key, value)?;
        }
        for (key, value) in &self.labels {
            validate::label(key, value)?;
        }
        for volume in &self.volumes {
            volume.validate()?;
        }
        Ok(())
    }

    /// Arguments after the runtime binary for a detached keep-alive start
    pub fn build_run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        if self.auto_remove {
            args.push("--rm".to_string());
        }

        args.push("--name".to_string());
        args.push(self.name.clone());

        // Resource limits
        args.push("--memory".to_string());
        args.push(self.memory.clone());
        args.push("--cpus".to_string());
        args.push(self.cpus.clone());

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.to_arg());
        }

        for vol in &self.volumes {
            args.push("-v".to_string());
            args.push(vol.to_arg());
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("-w".to_string());
        args.push(self.working_dir.clone());

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.extend(KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()));

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_applies_defaults() {
        let config =
            ContainerConfig::resolve(&ContainerDefaults::default(), ContainerOverrides::new())
                .unwrap();

        assert_eq!(config.image, "ubuntu:22.04");
        assert_eq!(config.memory, "2g");
        assert_eq!(config.cpus, "2");
        assert_eq!(config.working_dir, "/workspace");
        let ports: Vec<String> = config.ports.iter().map(PortMapping::to_arg).collect();
        assert_eq!(ports, vec!["8080", "3000"]);
        assert!(config.name.starts_with("crucible-"));
        assert_eq!(config.labels.get(ID_LABEL), Some(&config.id.to_string()));
    }

    #[test]
    fn test_resolve_overrides_win() {
        let config = ContainerConfig::resolve(
            &ContainerDefaults::default(),
            ContainerOverrides::new()
                .with_name("x")
                .with_memory("1g")
                .with_env("TERM", "dumb")
                .with_env("EXTRA", "1")
                .with_ports(vec![]),
        )
        .unwrap();

        assert_eq!(config.name, "x");
        assert_eq!(config.memory, "1g");
        assert_eq!(config.env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(config.env.get("EXTRA").map(String::as_str), Some("1"));
        assert!(config.env.contains_key("DEBIAN_FRONTEND"));
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_resolve_mints_unique_ids() {
        let defaults = ContainerDefaults::default();
        let a = ContainerConfig::resolve(&defaults, ContainerOverrides::new()).unwrap();
        let b = ContainerConfig::resolve(&defaults, ContainerOverrides::new()).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let defaults = ContainerDefaults::default();
        let bad_memory = ContainerOverrides::new().with_memory("lots");
        assert!(matches!(
            ContainerConfig::resolve(&defaults, bad_memory),
            Err(Error::Validation(_))
        ));

        let bad_name = ContainerOverrides::new().with_name("--privileged");
        assert!(ContainerConfig::resolve(&defaults, bad_name).is_err());

        let bad_volume = ContainerOverrides::new().with_volume(VolumeMount::new("rel", "/data"));
        assert!(ContainerConfig::resolve(&defaults, bad_volume).is_err());
    }

    #[test]
    fn test_build_run_args() {
        let config = ContainerConfig::resolve(
            &ContainerDefaults::default(),
            ContainerOverrides::new()
                .with_name("box")
                .with_volume(VolumeMount::new("/srv/data", "/data").read_only())
                .with_auto_remove(true),
        )
        .unwrap();

        let args = config.build_run_args();

        assert_eq!(&args[..3], &["run", "-d", "--rm"]);
        assert!(args.windows(2).any(|w| w == ["--name", "box"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "2g"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
        assert!(args.windows(2).any(|w| w == ["-p", "8080"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/srv/data:/data:ro"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-e", "DEBIAN_FRONTEND=noninteractive"]));
        assert!(args.windows(2).any(|w| w == ["-w", "/workspace"]));
        assert_eq!(&args[args.len() - 3..], &["ubuntu:22.04", "sleep", "infinity"]);
    }

    #[test]
    fn test_default_ports_leave_host_port_to_engine() {
        let defaults = ContainerDefaults::default();
        let host_ports = |config: &ContainerConfig| -> Vec<u16> {
            config.ports.iter().filter_map(|p| p.host).collect()
        };

        let a = ContainerConfig::resolve(&defaults, ContainerOverrides::new()).unwrap();
        let b = ContainerConfig::resolve(&defaults, ContainerOverrides::new()).unwrap();

        assert!(!a.ports.is_empty());
        assert!(host_ports(&a).is_empty());
        assert!(host_ports(&b).is_empty());

        let publish = |config: &ContainerConfig| -> Vec<String> {
            config
                .build_run_args()
                .windows(2)
                .filter(|w| w[0] == "-p")
                .map(|w| w[1].clone())
                .collect()
        };
        assert!(publish(&a).iter().all(|p| !p.contains(':')));
        assert!(publish(&b).iter().all(|p| !p.contains(':')));
    }

    #[test]
    fn test_port_mapping_parse() {
        assert_eq!("8080:80".parse::<PortMapping>().unwrap(), PortMapping::new(8080, 80));

        let udp: PortMapping = "53/udp".parse().unwrap();
        assert_eq!(udp.host, None);
        assert_eq!(udp.protocol, Protocol::Udp);
        assert_eq!(udp.to_arg(), "53/udp");

        assert!("0:80".parse::<PortMapping>().is_err());
        assert!("80:http".parse::<PortMapping>().is_err());
        assert!("80/sctp".parse::<PortMapping>().is_err());
    }
}
