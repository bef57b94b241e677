//! Operator-facing entry point
//!
//! Every container and stack change runs on its own spawned task, so a
//! caller that goes away mid-transaction cannot leave a redeploy half done,
//! and a slow engine call on one resource never stalls another.

use crate::config::Settings;
use crate::container::{Container, ContainerDelta};
use crate::engine::{ContainerFilter, DockerEngine, Engine};
use crate::error::{EngineError, KeelError, ResourceKind, Result};
use crate::image::{split_reference, BuildOutput, BuildRequest, Image};
use crate::lock::LockManager;
use crate::network::{Network, NetworkSpec};
use crate::reconcile::{ContainerReconciler, StackReconciler};
use crate::storage::{Volume, VolumeSpec};
use crate::system::{DiskUsage, SystemInfo};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Container, stack, network, volume and image operations against one
/// engine
pub struct Manager {
    engine: Arc<dyn Engine>,
    containers: ContainerReconciler,
    stacks: StackReconciler,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(engine: Arc<dyn Engine>, settings: &Settings) -> Self {
        let containers =
            ContainerReconciler::new(engine.clone(), LockManager::new(), settings.timeouts());
        let stacks = StackReconciler::new(containers.clone(), settings.stacks_dir.clone());
        Self {
            engine,
            containers,
            stacks,
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect to the engine named in `settings`
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let engine =
            DockerEngine::connect(settings.docker_host.as_deref(), settings.engine_timeout).await?;
        Ok(Self::new(Arc::new(engine), settings))
    }

    /// Cancel reconciliations that have not stopped a container yet
    pub fn cancel_pending(&self) {
        self.shutdown.cancel();
    }

    async fn spawn<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(task)
            .await
            .map_err(|e| KeelError::Internal(format!("reconciliation task failed: {}", e)))?
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        let filter = ContainerFilter {
            all,
            ..ContainerFilter::default()
        };
        Ok(self.engine.list_containers(&filter).await?)
    }

    pub async fn inspect_container(&self, id_or_name: &str) -> Result<Container> {
        Ok(self.engine.inspect_container(id_or_name).await?)
    }

    pub async fn start(&self, id_or_name: &str) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        self.spawn(async move { reconciler.start(&id).await }).await
    }

    pub async fn stop(&self, id_or_name: &str) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        self.spawn(async move { reconciler.stop(&id).await }).await
    }

    pub async fn restart(&self, id_or_name: &str) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        self.spawn(async move { reconciler.restart(&id).await }).await
    }

    pub async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        self.spawn(async move { reconciler.remove(&id, force).await })
            .await
    }

    pub async fn rename(&self, id_or_name: &str, new_name: &str) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        let new_name = new_name.to_string();
        self.spawn(async move { reconciler.rename(&id, &new_name).await })
            .await
    }

    /// Redeploy a container with `delta` applied
    pub async fn update(&self, id_or_name: &str, delta: ContainerDelta) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        let cancel = self.shutdown.child_token();
        self.spawn(async move { reconciler.update(&id, &delta, &cancel).await })
            .await
    }

    pub async fn attach_volume(
        &self,
        id_or_name: &str,
        volume: &str,
        mount_point: &str,
        mode: Option<&str>,
    ) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        let (volume, mount_point) = (volume.to_string(), mount_point.to_string());
        let mode = mode.map(str::to_string);
        let cancel = self.shutdown.child_token();
        self.spawn(async move {
            reconciler
                .attach_volume(&id, &volume, &mount_point, mode.as_deref(), &cancel)
                .await
        })
        .await
    }

    pub async fn connect_network(
        &self,
        id_or_name: &str,
        network: &str,
        aliases: Vec<String>,
    ) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        let network = network.to_string();
        self.spawn(async move { reconciler.connect_network(&id, &network, &aliases).await })
            .await
    }

    pub async fn disconnect_network(&self, id_or_name: &str, network: &str) -> Result<Container> {
        let (reconciler, id) = (self.containers.clone(), id_or_name.to_string());
        let network = network.to_string();
        self.spawn(async move { reconciler.disconnect_network(&id, &network).await })
            .await
    }

    /// Path and text of the compose file a container was deployed from
    pub async fn compose_file(&self, id_or_name: &str) -> Result<(PathBuf, String)> {
        self.stacks.compose_file(id_or_name).await
    }

    /// Apply edited compose text to the stack a container belongs to
    pub async fn edit_compose_file(
        &self,
        id_or_name: &str,
        compose_text: String,
    ) -> Result<Vec<Container>> {
        let container = self.engine.inspect_container(id_or_name).await?;
        let project = container
            .started_with
            .project()
            .map(str::to_string)
            .ok_or_else(|| KeelError::NotComposeManaged(container.name.clone()))?;

        let stacks = self.stacks.clone();
        let cancel = self.shutdown.child_token();
        self.spawn(async move {
            stacks
                .apply_compose_edit(&project, &compose_text, &cancel)
                .await
        })
        .await
    }

    /// Apply compose text to a project by name
    pub async fn apply_compose(&self, project: &str, compose_text: String) -> Result<Vec<Container>> {
        let (stacks, project) = (self.stacks.clone(), project.to_string());
        let cancel = self.shutdown.child_token();
        self.spawn(async move {
            stacks
                .apply_compose_edit(&project, &compose_text, &cancel)
                .await
        })
        .await
    }

    /// Deploy a new stack from pasted compose text
    pub async fn create_stack(&self, compose_text: String) -> Result<Vec<Container>> {
        let stacks = self.stacks.clone();
        let cancel = self.shutdown.child_token();
        self.spawn(async move { stacks.create_stack(&compose_text, &cancel).await })
            .await
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        Ok(self.engine.list_networks().await?)
    }

    pub async fn create_network(&self, spec: &NetworkSpec) -> Result<Network> {
        if spec.name.trim().is_empty() {
            return Err(KeelError::InvalidConfig("network name is empty".to_string()));
        }
        info!(network = %spec.name, driver = %spec.driver, "creating network");
        let id = self.engine.create_network(spec).await?;
        Ok(self.engine.inspect_network(&id).await?)
    }

    pub async fn remove_network(&self, id_or_name: &str) -> Result<()> {
        info!(network = %id_or_name, "removing network");
        Ok(self.engine.remove_network(id_or_name).await?)
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.engine.list_volumes().await?)
    }

    /// Create a named volume, or a bind declaration when the spec carries
    /// bind options
    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        if spec.name.trim().is_empty() {
            return Err(KeelError::InvalidConfig("volume name is empty".to_string()));
        }
        info!(volume = %spec.name, driver = %spec.driver, "creating volume");
        Ok(self.engine.create_volume(spec).await?)
    }

    /// Delete a volume. A volume referenced by any container, running or
    /// not, is a `Conflict` naming that container, and is left in place.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        let users = self
            .engine
            .list_containers(&ContainerFilter::all().volume(name))
            .await?;
        if let Some(user) = users.first() {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Volume,
                id: name.to_string(),
                message: format!("in use by container {} ({})", user.name, user.short_id()),
            }
            .into());
        }

        info!(volume = %name, "removing volume");
        Ok(self.engine.remove_volume(name, false).await?)
    }

    pub async fn build_image(&self, request: &BuildRequest) -> Result<BuildOutput> {
        request.validate()?;
        info!(tag = %request.tag, "building image");
        Ok(self.engine.build_image(request).await?)
    }

    /// Image as a tar archive stream
    pub fn export_image<'a>(&'a self, reference: &'a str) -> BoxStream<'a, Result<Bytes>> {
        self.engine
            .export_image(reference)
            .map(|chunk| chunk.map_err(KeelError::from))
            .boxed()
    }

    /// Write an image archive to `writer`. Returns the bytes written.
    pub async fn save_image<W>(&self, reference: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.export_image(reference);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Load an image archive. Returns the image references it contained.
    pub async fn import_image(&self, archive: Bytes) -> Result<Vec<String>> {
        let loaded = self.engine.import_image(archive).await?;
        info!(images = ?loaded, "images loaded");
        Ok(loaded)
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = self.engine.list_images().await?;
        images.sort_by(|a, b| a.tags.first().cmp(&b.tags.first()).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<Image> {
        Ok(self.engine.inspect_image(reference).await?)
    }

    pub async fn pull_image(&self, reference: &str) -> Result<Image> {
        info!(image = %reference, "pulling image");
        self.engine.pull_image(reference).await?;
        Ok(self.engine.inspect_image(reference).await?)
    }

    pub async fn push_image(&self, reference: &str) -> Result<()> {
        info!(image = %reference, "pushing image");
        Ok(self.engine.push_image(reference).await?)
    }

    /// Point `target` (`repo[:tag]`) at the image `source` refers to
    pub async fn tag_image(&self, source: &str, target: &str) -> Result<Image> {
        let (repository, tag) = split_reference(target);
        if repository.is_empty() || tag.is_empty() {
            return Err(KeelError::InvalidConfig(format!(
                "'{}' is not a repository[:tag] reference",
                target
            )));
        }
        info!(source = %source, target = %target, "tagging image");
        self.engine.tag_image(source, repository, tag).await?;
        Ok(self.engine.inspect_image(target).await?)
    }

    /// Delete an image reference. Returns the untagged references and
    /// deleted image IDs.
    pub async fn remove_image(&self, reference: &str, force: bool) -> Result<Vec<String>> {
        info!(image = %reference, force, "removing image");
        Ok(self.engine.remove_image(reference, force).await?)
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        Ok(self.engine.system_info().await?)
    }

    pub async fn disk_usage(&self) -> Result<DiskUsage> {
        Ok(self.engine.disk_usage().await?)
    }
}
