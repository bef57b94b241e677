//! Image build requests
//!
//! Builds are delegated to the engine. This module only checks the inline
//! Dockerfile is plausible and packs it into the tar build context the
//! engine expects.

use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the build file inside the generated context
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Build of an image from inline Dockerfile text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Dockerfile contents
    pub dockerfile: String,
    /// Tag for the built image
    pub tag: String,
    /// Build arguments
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// No cache
    #[serde(default)]
    pub no_cache: bool,
}

impl BuildRequest {
    /// Create a new build request
    pub fn new(dockerfile: &str, tag: &str) -> Self {
        Self {
            dockerfile: dockerfile.to_string(),
            tag: tag.to_string(),
            build_args: BTreeMap::new(),
            no_cache: false,
        }
    }

    /// Add build argument
    pub fn arg(mut self, key: &str, value: &str) -> Self {
        self.build_args.insert(key.to_string(), value.to_string());
        self
    }

    /// Disable the build cache
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Reject requests the engine would fail on anyway
    pub fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() || self.tag.chars().any(char::is_whitespace) {
            return Err(KeelError::InvalidConfig(format!(
                "invalid image tag '{}'",
                self.tag
            )));
        }
        check_dockerfile(&self.dockerfile)
    }

    /// In-memory tar archive holding the Dockerfile as the whole build
    /// context
    pub fn context_archive(&self) -> Result<Vec<u8>> {
        let data = self.dockerfile.as_bytes();

        let mut header = tar::Header::new_gnu();
        header.set_path(DOCKERFILE_NAME)?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();

        let mut archive = tar::Builder::new(Vec::new());
        archive.append(&header, data)?;
        Ok(archive.into_inner()?)
    }
}

/// The first instruction must be `FROM`, optionally preceded by `ARG`s.
fn check_dockerfile(content: &str) -> Result<()> {
    let mut continued = false;

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if continued {
            continued = line.ends_with('\\');
            continue;
        }
        continued = line.ends_with('\\');

        let instruction = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();

        match instruction.as_str() {
            "FROM" => return Ok(()),
            "ARG" => continue,
            _ => {
                return Err(KeelError::DockerfileParse {
                    line: line_num + 1,
                    message: format!("{} before FROM", instruction),
                })
            }
        }
    }

    Err(KeelError::DockerfileParse {
        line: 0,
        message: "No FROM instruction found".to_string(),
    })
}
