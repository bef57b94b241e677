//! Labels that tie engine resources to a compose project

use crate::container::StartedWith;
use std::collections::BTreeMap;

pub const PROJECT: &str = "com.docker.compose.project";
pub const SERVICE: &str = "com.docker.compose.service";
pub const WORKING_DIR: &str = "com.docker.compose.project.working_dir";
pub const CONFIG_FILES: &str = "com.docker.compose.project.config_files";
pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
pub const ONEOFF: &str = "com.docker.compose.oneoff";
pub const NETWORK: &str = "com.docker.compose.network";
pub const VOLUME: &str = "com.docker.compose.volume";

/// Hash of the service definition a container was created from
pub const CONFIG_HASH: &str = "io.keel.config-hash";

/// Classify a container by its labels
pub fn started_with(labels: &BTreeMap<String, String>) -> StartedWith {
    match labels.get(PROJECT) {
        Some(project) if !project.is_empty() => StartedWith::Compose {
            project: project.clone(),
            service: labels.get(SERVICE).cloned().unwrap_or_default(),
        },
        _ => StartedWith::Direct,
    }
}

/// Label filter selecting every container of a project
pub fn project_filter(project: &str) -> String {
    format!("{}={}", PROJECT, project)
}
