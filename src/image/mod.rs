//! Image management module
//!
//! Building from inline Dockerfile text, pulling and pushing, and moving
//! images in and out of the engine as archives.

pub mod builder;

pub use builder::BuildRequest;

use chrono::{DateTime, Utc};

/// Tag assumed when a reference names none
pub const DEFAULT_TAG: &str = "latest";

/// Normalized local image
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Image {
    /// Image ID (`sha256:...`)
    pub id: String,
    /// `repository:tag` references pointing at this image
    pub tags: Vec<String>,
    /// Size in bytes
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    /// Containers using the image, when the engine reports it
    pub containers: Option<u64>,
}

impl Image {
    /// First 12 hex digits of the ID
    pub fn short_id(&self) -> &str {
        let hex = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        &hex[..hex.len().min(12)]
    }
}

/// Outcome of a build
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildOutput {
    /// Image ID reported by the engine, if any
    pub image_id: Option<String>,
    /// Build log lines in arrival order
    pub logs: Vec<String>,
}

/// Image reference named by one line of engine load output
/// (`Loaded image: <ref>` or `Loaded image ID: <id>`)
pub fn loaded_reference(line: &str) -> Option<String> {
    let line = line.trim();
    line.strip_prefix("Loaded image ID: ")
        .or_else(|| line.strip_prefix("Loaded image: "))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

/// Split a reference into repository and tag.
///
/// Digest references come back whole with an empty tag; references without
/// a tag get [`DEFAULT_TAG`]. A registry port (`host:5000/app`) is not a tag.
pub fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    match reference.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') && !repository.is_empty() => {
            (repository, tag)
        }
        _ => (reference, DEFAULT_TAG),
    }
}
