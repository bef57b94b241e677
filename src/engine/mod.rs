//! Engine client adapter
//!
//! One operation per engine primitive. Results come back already
//! normalized; failures are classified into [`EngineError`]. Nothing here
//! retries.

pub mod docker;
#[cfg(test)]
pub mod fake;

use crate::container::{Container, ContainerSpec};
use crate::error::EngineResult;
use crate::image::{BuildOutput, BuildRequest, Image};
use crate::network::{Network, NetworkSpec};
use crate::storage::{Volume, VolumeSpec};
use crate::system::{DiskUsage, SystemInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

pub use docker::DockerEngine;

/// Selection of containers to list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include stopped containers
    pub all: bool,
    /// `key=value` or bare `key` label filters, all of which must match
    pub labels: Vec<String>,
    /// Only containers mounting this volume
    pub volume: Option<String>,
    /// Only containers whose name contains this string
    pub name: Option<String>,
}

impl ContainerFilter {
    /// Every container, running or not
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Add a label filter
    pub fn label(mut self, filter: &str) -> Self {
        self.labels.push(filter.to_string());
        self
    }

    /// Restrict to containers mounting `volume`
    pub fn volume(mut self, volume: &str) -> Self {
        self.volume = Some(volume.to_string());
        self
    }
}

/// Container engine control API
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check the engine answers
    async fn ping(&self) -> EngineResult<()>;

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Container>;

    async fn list_containers(&self, filter: &ContainerFilter) -> EngineResult<Vec<Container>>;

    /// Create a container with every requested network attached. Returns the
    /// new ID; the container is not started.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// Graceful stop; the engine kills the process after `timeout`
    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()>;

    async fn kill_container(&self, id: &str) -> EngineResult<()>;

    async fn restart_container(&self, id: &str, timeout: Duration) -> EngineResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()>;

    async fn disconnect_network(&self, network: &str, container: &str) -> EngineResult<()>;

    async fn inspect_network(&self, id_or_name: &str) -> EngineResult<Network>;

    async fn list_networks(&self) -> EngineResult<Vec<Network>>;

    /// Returns the new network ID
    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<String>;

    async fn remove_network(&self, id_or_name: &str) -> EngineResult<()>;

    async fn inspect_volume(&self, name: &str) -> EngineResult<Volume>;

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>>;

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<Volume>;

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()>;

    async fn inspect_image(&self, reference: &str) -> EngineResult<Image>;

    async fn list_images(&self) -> EngineResult<Vec<Image>>;

    /// Fetch an image from its registry. Creating a container never pulls.
    async fn pull_image(&self, reference: &str) -> EngineResult<()>;

    async fn push_image(&self, reference: &str) -> EngineResult<()>;

    /// Add `repository:tag` as a reference to `source`
    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()>;

    /// Returns the untagged references and deleted IDs
    async fn remove_image(&self, reference: &str, force: bool) -> EngineResult<Vec<String>>;

    async fn build_image(&self, request: &BuildRequest) -> EngineResult<BuildOutput>;

    /// Stream an image out of the engine as a tar archive
    fn export_image<'a>(&'a self, reference: &'a str) -> BoxStream<'a, EngineResult<Bytes>>;

    /// Load a tar archive into the engine. Returns the loaded references.
    async fn import_image(&self, archive: Bytes) -> EngineResult<Vec<String>>;

    async fn system_info(&self) -> EngineResult<SystemInfo>;

    async fn disk_usage(&self) -> EngineResult<DiskUsage>;
}
