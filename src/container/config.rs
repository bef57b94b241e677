//! Container entities
//!
//! These are immutable projections of engine state. A `Container` is produced
//! fresh by each inspection; changing one means issuing engine calls and
//! inspecting again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container is restarting
    Restarting,
    /// Container has exited
    Exited,
    /// Container is in an error state
    Dead,
    /// Container is being removed
    Removing,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Removing => write!(f, "removing"),
        }
    }
}

/// How a container came to exist, derived once from its labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StartedWith {
    /// Member of a compose project
    Compose { project: String, service: String },
    /// Plain `run`/`create`
    Direct,
}

impl StartedWith {
    pub fn project(&self) -> Option<&str> {
        match self {
            StartedWith::Compose { project, .. } => Some(project),
            StartedWith::Direct => None,
        }
    }
}

/// Host side of a published port
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host IP, absent means all interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Host port, absent means engine-assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

impl PortBinding {
    pub fn host_port(port: impl Into<String>) -> Self {
        Self {
            host_ip: None,
            host_port: Some(port.into()),
        }
    }
}

/// Mapping of `"<port>/<proto>"` to host bindings. An empty list means the
/// port is exposed but not published.
pub type PortMap = BTreeMap<String, Vec<PortBinding>>;

/// Mount type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Engine-managed named volume
    Named,
    /// Host path
    Bind,
    /// In-memory filesystem
    Tmpfs,
}

/// Volume mount descriptor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: MountKind,
    /// Volume name for named mounts, host path for binds, empty for tmpfs
    pub source: String,
    pub destination: String,
    /// Engine mode string (`rw`, `ro`, `z`, ...)
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn named(volume: &str, destination: &str) -> Self {
        Self {
            kind: MountKind::Named,
            source: volume.to_string(),
            destination: destination.to_string(),
            mode: String::new(),
            read_only: false,
        }
    }

    pub fn bind(host_path: &str, destination: &str) -> Self {
        Self {
            kind: MountKind::Bind,
            source: host_path.to_string(),
            destination: destination.to_string(),
            mode: String::new(),
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Network attachment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl NetworkAttachment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        if !self.aliases.iter().any(|a| a == alias) {
            self.aliases.push(alias.to_string());
        }
        self
    }
}

/// Settings that are not part of the operator-facing identity but must
/// survive a recreate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

/// Normalized container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Engine-assigned ID, never changes for the life of the container
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    /// `KEY=VALUE` entries in engine order
    pub environment: Vec<String>,
    pub ports: PortMap,
    pub volumes: Vec<Mount>,
    /// Attachments sorted by network name
    pub networks: Vec<NetworkAttachment>,
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    pub started_with: StartedWith,
}

impl Container {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn network_names(&self) -> BTreeSet<&str> {
        self.networks.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn mounts_volume(&self, volume: &str) -> bool {
        self.volumes
            .iter()
            .any(|m| m.kind == MountKind::Named && m.source == volume)
    }

    /// Full creation spec reproducing this container under `name`
    pub fn to_spec(&self, name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: self.image.clone(),
            environment: self.environment.clone(),
            ports: self.ports.clone(),
            volumes: self.volumes.clone(),
            networks: self.networks.clone(),
            labels: self.labels.clone(),
            runtime: self.runtime.clone(),
        }
    }

    /// Whether two containers carry the same configuration, ignoring
    /// identity, status and creation time
    pub fn same_configuration(&self, other: &Container) -> bool {
        self.to_spec(&self.name) == other.to_spec(&other.name)
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub environment: Vec<String>,
    pub ports: PortMap,
    pub volumes: Vec<Mount>,
    pub networks: Vec<NetworkAttachment>,
    pub labels: BTreeMap<String, String>,
    pub runtime: RuntimeSettings,
}

impl ContainerSpec {
    /// Create a new container spec
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Self::default()
        }
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.push(format!("{}={}", key, value));
        self
    }

    /// Publish a container port on a host port
    pub fn port(mut self, container_port: &str, host_port: u16) -> Self {
        self.ports
            .entry(container_port.to_string())
            .or_default()
            .push(PortBinding::host_port(host_port.to_string()));
        self
    }

    /// Add volume mount
    pub fn volume(mut self, mount: Mount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// Attach to a network
    pub fn network(mut self, attachment: NetworkAttachment) -> Self {
        self.networks.push(attachment);
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Split a `KEY=VALUE` entry. Entries without `=` have an empty value.
pub fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Collapse duplicate keys, keeping the position of the first occurrence and
/// the value of the last.
pub fn dedupe_environment(entries: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let key = env_key(entry);
        match result.iter().position(|e| env_key(e) == key) {
            Some(idx) => result[idx] = entry.clone(),
            None => result.push(entry.clone()),
        }
    }
    result
}
