//! Volume entity and creation request

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default volume driver
pub const DEFAULT_VOLUME_DRIVER: &str = "local";

/// Normalized volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, unique per engine
    pub name: String,
    /// Volume driver
    pub driver: String,
    /// Engine-managed mount point. Bind declarations have none.
    pub mountpoint: Option<String>,
    /// Host directory backing a bind declaration
    pub host_path: Option<String>,
    pub is_bind_mount: bool,
    /// Volume scope
    pub scope: String,
    /// Driver options
    pub options: BTreeMap<String, String>,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
}

/// Volume creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name
    pub name: String,
    /// Volume driver
    pub driver: String,
    /// Driver options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Volume labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeSpec {
    /// Create a named volume request with the local driver
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: DEFAULT_VOLUME_DRIVER.to_string(),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Declare a volume backed by a host directory.
    ///
    /// Uses the local driver's bind options so the volume can be mounted by
    /// name like any other.
    pub fn bind(name: &str, host_path: &str) -> Self {
        Self::new(name)
            .option("type", "none")
            .option("o", "bind")
            .option("device", host_path)
    }

    /// Set driver
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    /// Add option
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Whether driver options describe a bind declaration, returning the host
/// path if so
pub fn bind_device(options: &BTreeMap<String, String>) -> Option<&str> {
    let is_bind = options.get("type").map(String::as_str) == Some("none")
        && options.get("o").map(String::as_str) == Some("bind");
    if is_bind {
        options.get("device").map(String::as_str)
    } else {
        None
    }
}
