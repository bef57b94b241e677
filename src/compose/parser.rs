//! Docker Compose file parser

use super::config::{ComposeConfig, VolumeMount};
use super::graph;
use crate::error::{KeelError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose text, interpolating against the process environment
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        Self::parse_with(content, &|key| std::env::var(key).ok())
    }

    /// Parse compose text, interpolating against a fixed environment
    pub fn parse_with_env(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        Self::parse_with(content, &|key| env.get(key).cloned())
    }

    fn parse_with(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<ComposeConfig> {
        let interpolated = interpolate(content, lookup)?;
        let config: ComposeConfig = serde_yaml::from_str(&interpolated)
            .map_err(|e| KeelError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;
        Ok(config)
    }

    /// Validate compose configuration.
    ///
    /// Structural problems are `ComposeParse`; dependency problems are
    /// `InvalidComposeGraph`. Returns warnings for things that are accepted
    /// but ignored.
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(KeelError::ComposeParse(
                "compose file declares no services".to_string(),
            ));
        }

        for (name, service) in &config.services {
            if service.build.is_some() {
                return Err(KeelError::ComposeParse(format!(
                    "Service '{}' uses 'build', which stacks do not support; build the image first and reference it with 'image'",
                    name
                )));
            }
            if service.image.as_deref().map_or(true, |i| i.trim().is_empty()) {
                return Err(KeelError::ComposeParse(format!(
                    "Service '{}' must have 'image' specified",
                    name
                )));
            }

            if let Some(networks) = &service.networks {
                for (net, _) in networks.entries() {
                    if net != "default" && !config.networks.contains_key(&net) {
                        return Err(KeelError::ComposeParse(format!(
                            "Service '{}' refers to undefined network '{}'",
                            name, net
                        )));
                    }
                }
            }

            for mount in service.volumes.iter().flatten() {
                if let Some(volume) = named_volume_source(mount) {
                    if !config.volumes.contains_key(volume) {
                        return Err(KeelError::ComposeParse(format!(
                            "Service '{}' refers to undefined volume '{}'",
                            name, volume
                        )));
                    }
                }
            }

            if let Some(super::config::DependsOnConfig::Map(map)) = &service.depends_on {
                if map.values().any(|c| c.condition.is_some()) {
                    warnings.push(format!(
                        "Service '{}': depends_on conditions are treated as start order only",
                        name
                    ));
                }
            }
        }

        graph::deploy_order(config)?;

        Ok(warnings)
    }
}

/// Source of a mount when it names a volume rather than a host path
pub fn named_volume_source(mount: &VolumeMount) -> Option<&str> {
    match mount {
        VolumeMount::Short(s) => {
            let (source, _) = s.split_once(':')?;
            is_volume_name(source).then_some(source)
        }
        VolumeMount::Long(l) => match l.mount_type.as_deref() {
            Some("volume") | None => l.source.as_deref().filter(|s| is_volume_name(s)),
            _ => None,
        },
    }
}

/// Host paths start with `/`, `.` or `~`; anything else is a volume name
pub fn is_volume_name(source: &str) -> bool {
    !source.is_empty() && !source.starts_with(['/', '.', '~'])
}

fn pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"\$(?:(?P<escaped>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<sep>:?[-?])(?P<arg>[^}]*))?\}|(?P<named>[A-Za-z_][A-Za-z0-9_]*))",
            )
        })
        .as_ref()
        .map_err(|e| KeelError::Internal(format!("interpolation pattern: {}", e)))
}

/// Substitute `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
/// `${VAR:?message}` and `${VAR?message}`. `$$` is a literal `$`.
pub fn interpolate(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut error = None;

    let output = pattern()?.replace_all(input, |caps: &Captures| {
        if caps.name("escaped").is_some() {
            return "$".to_string();
        }
        if let Some(name) = caps.name("named") {
            return lookup(name.as_str()).unwrap_or_default();
        }

        let name = caps.name("braced").map_or("", |m| m.as_str());
        let value = lookup(name);
        let arg = caps.name("arg").map_or("", |m| m.as_str());

        match caps.name("sep").map(|m| m.as_str()) {
            None => value.unwrap_or_default(),
            Some(":-") => value.filter(|v| !v.is_empty()).unwrap_or_else(|| arg.to_string()),
            Some("-") => value.unwrap_or_else(|| arg.to_string()),
            Some(sep) => {
                let missing = match sep {
                    ":?" => value.as_deref().map_or(true, str::is_empty),
                    _ => value.is_none(),
                };
                if missing {
                    error.get_or_insert_with(|| {
                        KeelError::ComposeParse(format!(
                            "required variable {} is missing a value: {}",
                            name, arg
                        ))
                    });
                }
                value.unwrap_or_default()
            }
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(output.into_owned()),
    }
}
