//! Desired configuration delta and its merge with the current container

use super::config::{
    dedupe_environment, env_key, Container, ContainerSpec, Mount, MountKind, NetworkAttachment,
    PortMap,
};
use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fields an operator wants to change. Absent fields are carried over
/// from the current container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Full replacement list of `KEY=VALUE` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Mount>>,
    /// Full replacement network set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<NetworkAttachment>>,
    /// Merged over existing labels; never removes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl ContainerDelta {
    /// Parse a delta from JSON, rejecting unknown fields
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| KeelError::InvalidDelta(e.to_string()))
    }

    pub fn image(image: &str) -> Self {
        Self {
            image: Some(image.to_string()),
            ..Self::default()
        }
    }

    pub fn with_environment(mut self, environment: Vec<String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<Mount>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    pub fn with_networks(mut self, networks: Vec<NetworkAttachment>) -> Self {
        self.networks = Some(networks);
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Check the delta is well formed before anything touches the engine
    pub fn validate(&self) -> Result<()> {
        if let Some(image) = &self.image {
            if image.trim().is_empty() || image.chars().any(char::is_whitespace) {
                return Err(KeelError::InvalidDelta(format!(
                    "invalid image reference '{}'",
                    image
                )));
            }
        }

        if let Some(env) = &self.environment {
            for entry in env {
                if !entry.contains('=') || env_key(entry).is_empty() {
                    return Err(KeelError::InvalidDelta(format!(
                        "environment entry '{}' is not KEY=VALUE",
                        entry
                    )));
                }
            }
        }

        if let Some(ports) = &self.ports {
            for key in ports.keys() {
                normalize_port_key(key)?;
            }
        }

        if let Some(volumes) = &self.volumes {
            for mount in volumes {
                if !mount.destination.starts_with('/') {
                    return Err(KeelError::InvalidDelta(format!(
                        "mount destination '{}' must be an absolute path",
                        mount.destination
                    )));
                }
                if mount.kind != MountKind::Tmpfs && mount.source.is_empty() {
                    return Err(KeelError::InvalidDelta(format!(
                        "mount at '{}' has no source",
                        mount.destination
                    )));
                }
            }
        }

        if let Some(networks) = &self.networks {
            if networks.iter().any(|n| n.name.trim().is_empty()) {
                return Err(KeelError::InvalidDelta("empty network name".to_string()));
            }
        }

        Ok(())
    }

    /// Produce the full target spec. Merge is total: every field of the
    /// result is set, either from the delta or from `current`.
    pub fn merge(&self, current: &Container, name: &str) -> Result<ContainerSpec> {
        self.validate()?;

        let mut spec = current.to_spec(name);

        if let Some(image) = &self.image {
            spec.image = image.clone();
        }

        if let Some(env) = &self.environment {
            spec.environment = dedupe_environment(env);
        }

        if let Some(ports) = &self.ports {
            let mut normalized = PortMap::new();
            for (key, bindings) in ports {
                normalized.insert(normalize_port_key(key)?, bindings.clone());
            }
            spec.ports = normalized;
        }

        if let Some(volumes) = &self.volumes {
            spec.volumes = volumes.clone();
        }

        if let Some(networks) = &self.networks {
            let mut networks = networks.clone();
            networks.sort();
            networks.dedup_by(|a, b| a.name == b.name);
            spec.networks = networks;
        }

        if let Some(labels) = &self.labels {
            spec.labels.extend(labels.clone());
        }

        if let Some(command) = &self.command {
            spec.runtime.command = Some(command.clone());
        }

        Ok(spec)
    }
}

/// `"80"` becomes `"80/tcp"`; anything that is not `<port>/<proto>` is
/// rejected.
pub fn normalize_port_key(key: &str) -> Result<String> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    let valid_proto = matches!(proto, "tcp" | "udp" | "sctp");
    if port.parse::<u16>().is_err() || !valid_proto {
        return Err(KeelError::InvalidDelta(format!(
            "invalid port '{}', expected <port>/<tcp|udp|sctp>",
            key
        )));
    }
    Ok(format!("{}/{}", port, proto))
}
