//! Docker Compose configuration types
//!
//! Only the parts of the compose format a stack needs are typed; unknown
//! keys are accepted and ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Docker Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational)
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build section. Stacks never build, so this is only inspected to
    /// reject it.
    #[serde(default)]
    pub build: Option<serde_yaml::Value>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Container name
    #[serde(default)]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Exposed ports
    #[serde(default)]
    pub expose: Option<Vec<StringOrNumber>>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to connect to
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// User
    #[serde(default)]
    pub user: Option<String>,
}

impl ServiceConfig {
    /// Names of the services this one depends on, sorted
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = match &self.depends_on {
            Some(DependsOnConfig::Array(arr)) => arr.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
            None => Vec::new(),
        };
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Scalar that YAML may type as a string or a number (`- 8080`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumber {
    String(String),
    Number(u64),
}

impl std::fmt::Display for StringOrNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StringOrNumber::String(s) => write!(f, "{}", s),
            StringOrNumber::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Argument vector, splitting the string form the way a shell would
    /// on whitespace and quotes
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            CommandConfig::Exec(arr) => arr.clone(),
            CommandConfig::Shell(s) => split_command(s),
        }
    }
}

fn split_command(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in input.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<EnvValue>>),
}

/// Environment map value; YAML types `PORT: 80` as a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::String(s) => write!(f, "{}", s),
            EnvValue::Number(n) => write!(f, "{}", n),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl EnvironmentConfig {
    /// `KEY=VALUE` entries. Keys without a value take it from `lookup`
    /// and are dropped when it has none.
    pub fn entries(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
        match self {
            EnvironmentConfig::Array(arr) => arr
                .iter()
                .filter_map(|item| match item.split_once('=') {
                    Some(_) => Some(item.clone()),
                    None => lookup(item).map(|v| format!("{}={}", item, v)),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .filter_map(|(key, value)| match value {
                    Some(v) => Some(format!("{}={}", key, v)),
                    None => lookup(key).map(|v| format!("{}={}", key, v)),
                })
                .collect(),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(StringOrNumber),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    pub published: Option<StringOrNumber>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs)
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl NetworksConfig {
    /// Network keys with their declared aliases
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        match self {
            NetworksConfig::Array(arr) => arr.iter().map(|n| (n.clone(), Vec::new())).collect(),
            NetworksConfig::Map(map) => map
                .iter()
                .map(|(name, config)| {
                    let aliases = config
                        .as_ref()
                        .and_then(|c| c.aliases.clone())
                        .unwrap_or_default();
                    (name.clone(), aliases)
                })
                .collect(),
        }
    }
}

/// Service network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for. Only start order is honoured.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, String>),
}

impl LabelsConfig {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Map(map) => map.clone(),
            LabelsConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    pub driver: Option<String>,
    /// Driver options
    #[serde(default)]
    pub driver_opts: Option<BTreeMap<String, String>>,
    /// External network
    pub external: Option<ExternalConfig>,
    /// Internal network
    pub internal: Option<bool>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Name
    pub name: Option<String>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    pub driver: Option<String>,
    /// Driver options
    #[serde(default)]
    pub driver_opts: Option<BTreeMap<String, String>>,
    /// External volume
    pub external: Option<ExternalConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Name
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        !matches!(self, ExternalConfig::Bool(false))
    }

    /// Name given in the legacy `external: { name: .. }` form
    pub fn name(&self) -> Option<&str> {
        match self {
            ExternalConfig::Named { name } => Some(name),
            ExternalConfig::Bool(_) => None,
        }
    }
}
