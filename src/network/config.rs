//! Network entity and creation request

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default network driver
pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";

/// Name of the engine's default bridge network
pub const DEFAULT_BRIDGE_NETWORK: &str = "bridge";

/// Networks the engine creates itself; they cannot be removed
pub const PREDEFINED_NETWORKS: &[&str] = &[DEFAULT_BRIDGE_NETWORK, "host", "none"];

/// Normalized network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Driver name (`bridge`, `overlay`, plugin names, ...)
    pub driver: String,
    /// Scope (`local`, `swarm`, `global`)
    pub scope: String,
    /// Internal network (no external access)
    pub internal: bool,
    /// Network labels
    pub labels: BTreeMap<String, String>,
    /// IDs of attached containers. Only populated by inspect, not by list.
    pub containers: Vec<String>,
}

impl Network {
    pub fn is_predefined(&self) -> bool {
        PREDEFINED_NETWORKS.contains(&self.name.as_str())
    }
}

/// Network creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: String,
    /// Internal network (no external access)
    #[serde(default)]
    pub internal: bool,
    /// Driver options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Network labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// Create a new network request with the default driver
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: DEFAULT_NETWORK_DRIVER.to_string(),
            internal: false,
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Set network driver
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    /// Add driver option
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set internal flag
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_spec_builder() {
        let spec = NetworkSpec::new("backend")
            .driver("overlay")
            .option("encrypted", "true")
            .label("com.docker.compose.project", "shop")
            .internal(true);

        assert_eq!(spec.name, "backend");
        assert_eq!(spec.driver, "overlay");
        assert_eq!(spec.options["encrypted"], "true");
        assert!(spec.internal);
    }

    #[test]
    fn test_predefined_networks() {
        let net = Network {
            id: "abc".into(),
            name: "bridge".into(),
            driver: "bridge".into(),
            scope: "local".into(),
            internal: false,
            labels: BTreeMap::new(),
            containers: vec![],
        };
        assert!(net.is_predefined());
    }
}
