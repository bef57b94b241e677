//! Compose stack reconciliation

use super::container::ContainerReconciler;
use crate::compose::labels;
use crate::compose::project::normalize_project_name;
use crate::compose::{compose_file_for, ComposeDocument, Project};
use crate::container::{Container, ContainerSpec, StartedWith};
use crate::engine::{ContainerFilter, Engine};
use crate::error::{EngineError, KeelError, ResourceKind, Result};
use crate::lock::ResourceKey;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name a created stack's compose text is stored under
pub const STACK_FILE_NAME: &str = "docker-compose.yml";

/// Resources created by one invocation, removed again if it fails
#[derive(Debug, Default)]
struct Created {
    containers: Vec<String>,
    networks: Vec<String>,
    volumes: Vec<String>,
}

/// Applies compose documents to the engine
#[derive(Clone)]
pub struct StackReconciler {
    containers: ContainerReconciler,
    stacks_dir: PathBuf,
}

impl StackReconciler {
    /// `stacks_dir` is where stacks created from pasted text keep their
    /// compose file
    pub fn new(containers: ContainerReconciler, stacks_dir: PathBuf) -> Self {
        Self {
            containers,
            stacks_dir,
        }
    }

    fn engine(&self) -> &Arc<dyn Engine> {
        self.containers.engine()
    }

    pub fn stacks_dir(&self) -> &Path {
        &self.stacks_dir
    }

    /// Every container of `project`, running or not
    pub async fn project_containers(&self, project: &str) -> Result<Vec<Container>> {
        let filter = ContainerFilter::all().label(&labels::project_filter(project));
        Ok(self.engine().list_containers(&filter).await?)
    }

    /// Path and raw text of the compose file behind a container
    pub async fn compose_file(&self, id_or_name: &str) -> Result<(PathBuf, String)> {
        let container = self.engine().inspect_container(id_or_name).await?;
        let path = compose_file_for(&container)?;
        let source = std::fs::read_to_string(&path).map_err(|e| {
            KeelError::ComposeFileUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Ok((path, source))
    }

    /// Deploy a brand-new stack from compose text.
    ///
    /// Services are created and started in dependency order, pulling
    /// images the engine does not have. If any step fails, everything this
    /// call created is removed again and the failure is reported as
    /// `PartialStackFailure`. A compose file already stored for the project
    /// is never overwritten.
    pub async fn create_stack(
        &self,
        compose_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Container>> {
        let document = ComposeDocument::parse(compose_text)?;
        for warning in document.warnings() {
            warn!("{}", warning);
        }

        let name = match document.declared_name() {
            Some(declared) => normalize_project_name(declared)?,
            None => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("stack-{}", &suffix[..8])
            }
        };

        let _stack = self
            .containers
            .locks()
            .try_acquire(ResourceKey::Stack(name.clone()))?;

        if !self.project_containers(&name).await?.is_empty() {
            return Err(KeelError::StackExists(name));
        }

        let working_dir = self.stacks_dir.join(&name);
        let config_file = working_dir.join(STACK_FILE_NAME);
        if config_file.exists() {
            warn!(project = %name, file = %config_file.display(), "compose file already stored for project");
            return Err(KeelError::StackExists(name));
        }
        let project = document.project(&name, &working_dir, &config_file)?;

        if cancel.is_cancelled() {
            return Err(KeelError::Cancelled(format!("stack {}", name)));
        }

        info!(project = %name, services = project.order.len(), "creating stack");
        document.save(&config_file)?;

        let mut created = Created::default();
        if let Err(source) = self.ensure_resources(&project, &mut created).await {
            warn!(project = %name, error = %source, "networks or volumes failed, removing stack");
            let rollback_failures = self.clean_up(&created).await;
            discard_file(&config_file);
            return Err(KeelError::PartialStackFailure {
                project: name,
                service: None,
                source: Box::new(source),
                rollback_failures,
            });
        }

        for service_name in &project.order {
            let Some(service) = project.services.get(service_name) else {
                continue;
            };
            let spec = project.container_spec(service);
            info!(project = %name, service = %service_name, container = %spec.name, "creating service");

            if let Err(source) = self.launch(&spec, &mut created).await {
                warn!(project = %name, service = %service_name, error = %source, "service failed, removing stack");
                let rollback_failures = self.clean_up(&created).await;
                discard_file(&config_file);
                return Err(KeelError::PartialStackFailure {
                    project: name,
                    service: Some(service_name.clone()),
                    source: Box::new(source),
                    rollback_failures,
                });
            }
        }

        info!(project = %name, "stack created");
        self.ordered_containers(&project).await
    }

    /// Bring a running stack in line with edited compose text.
    ///
    /// Only services whose definition changed are redeployed, each through
    /// the single-container transaction. Services missing from the new text
    /// are left running. On success the text replaces the project's compose
    /// file.
    ///
    /// On failure, networks, volumes and new services created by this call
    /// are removed again. Services already redeployed keep their new
    /// configuration.
    pub async fn apply_compose_edit(
        &self,
        project_name: &str,
        compose_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Container>> {
        let document = ComposeDocument::parse(compose_text)?;
        let project_name = normalize_project_name(project_name)?;
        if let Some(declared) = document.declared_name() {
            if normalize_project_name(declared)? != project_name {
                return Err(KeelError::ComposeParse(format!(
                    "document declares project '{}' but '{}' is being edited",
                    declared, project_name
                )));
            }
        }

        let locks = self.containers.locks();
        let _stack = locks.try_acquire(ResourceKey::Stack(project_name.clone()))?;

        let members = self.project_containers(&project_name).await?;
        if members.is_empty() {
            return Err(EngineError::NotFound {
                kind: ResourceKind::Container,
                id: format!("stack {}", project_name),
            }
            .into());
        }
        let _members = locks.try_acquire_all(
            members
                .iter()
                .map(|c| ResourceKey::Container(c.id.clone())),
        )?;
        // Re-read under the member locks
        let running = self.project_containers(&project_name).await?;

        let (working_dir, config_file) = self.locate(&project_name, &running);
        let project = document.project(&project_name, &working_dir, &config_file)?;

        if cancel.is_cancelled() {
            return Err(KeelError::Cancelled(format!("stack {}", project_name)));
        }

        for warning in document.warnings() {
            warn!(project = %project_name, "{}", warning);
        }
        let mut created = Created::default();
        if let Err(source) = self.ensure_resources(&project, &mut created).await {
            return Err(self
                .abandon_edit(&project_name, None, source, &created)
                .await);
        }

        let mut redeployed = 0usize;
        for service_name in &project.order {
            let Some(service) = project.services.get(service_name) else {
                continue;
            };
            let existing = running.iter().find(|c| service_of(c) == Some(service_name.as_str()));

            match existing {
                Some(current) if service.is_current(current) => {
                    debug!(project = %project_name, service = %service_name, "unchanged");
                }
                Some(current) => {
                    info!(project = %project_name, service = %service_name, "service changed, redeploying");
                    if let Err(source) = self
                        .containers
                        .replace(current, project.container_spec(service))
                        .await
                    {
                        return Err(self
                            .abandon_edit(&project_name, Some(service_name), source, &created)
                            .await);
                    }
                    redeployed += 1;
                }
                None => {
                    let spec = project.container_spec(service);
                    info!(project = %project_name, service = %service_name, container = %spec.name, "new service");
                    if let Err(source) = self.launch(&spec, &mut created).await {
                        return Err(self
                            .abandon_edit(&project_name, Some(service_name), source, &created)
                            .await);
                    }
                    redeployed += 1;
                }
            }
        }

        let declared: HashSet<&str> = project.services.keys().map(String::as_str).collect();
        for orphan in running
            .iter()
            .filter(|c| service_of(c).map_or(true, |s| !declared.contains(s)))
        {
            warn!(project = %project_name, container = %orphan.name, "orphan container left running");
        }

        if let Err(e) = document.save(&config_file) {
            warn!(project = %project_name, file = %config_file.display(), error = %e, "compose file not written");
        }

        info!(project = %project_name, redeployed, "stack edit applied");
        self.ordered_containers(&project).await
    }

    /// Remove what a failed edit created and describe the failure
    async fn abandon_edit(
        &self,
        project: &str,
        service: Option<&String>,
        source: KeelError,
        created: &Created,
    ) -> KeelError {
        warn!(project = %project, service = ?service, error = %source, "stack edit failed, removing what it created");
        let rollback_failures = self.clean_up(created).await;
        KeelError::PartialStackFailure {
            project: project.to_string(),
            service: service.cloned(),
            source: Box::new(source),
            rollback_failures,
        }
    }

    /// Working directory and compose file of an existing project
    fn locate(&self, project: &str, running: &[Container]) -> (PathBuf, PathBuf) {
        let working_dir = running
            .iter()
            .find_map(|c| c.labels.get(labels::WORKING_DIR))
            .map(PathBuf::from)
            .unwrap_or_else(|| self.stacks_dir.join(project));

        let config_file = running
            .iter()
            .find_map(|c| compose_file_for(c).ok())
            .unwrap_or_else(|| working_dir.join(STACK_FILE_NAME));

        (working_dir, config_file)
    }

    /// Create project networks and volumes that do not exist yet. External
    /// ones must already exist.
    async fn ensure_resources(&self, project: &Project, created: &mut Created) -> Result<()> {
        for network in &project.networks {
            match self.engine().inspect_network(&network.spec.name).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() && !network.external => {
                    debug!(network = %network.spec.name, "creating network");
                    self.engine().create_network(&network.spec).await?;
                    created.networks.push(network.spec.name.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }

        for volume in &project.volumes {
            match self.engine().inspect_volume(&volume.spec.name).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() && !volume.external => {
                    debug!(volume = %volume.spec.name, "creating volume");
                    self.engine().create_volume(&volume.spec).await?;
                    created.volumes.push(volume.spec.name.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    async fn launch(&self, spec: &ContainerSpec, created: &mut Created) -> Result<()> {
        self.containers.ensure_image(&spec.image).await?;
        let id = self.engine().create_container(spec).await?;
        created.containers.push(id.clone());
        self.containers
            .start_verified(&id, &spec.name)
            .await
            .map_err(|(_, e)| KeelError::Engine(e))
    }

    /// Best-effort removal, newest first. Networks and volumes that other
    /// containers have started using are kept. Returns what could not be
    /// removed.
    async fn clean_up(&self, created: &Created) -> Vec<String> {
        let mut failures = Vec::new();

        for id in created.containers.iter().rev() {
            if let Err(e) = self.engine().remove_container(id, true).await {
                warn!(container = %id, error = %e, "cleanup failed");
                failures.push(format!("remove container {}: {}", id, e));
            }
        }
        for name in created.networks.iter().rev() {
            if let Ok(network) = self.engine().inspect_network(name).await {
                if !network.containers.is_empty() {
                    debug!(network = %name, "network in use, keeping it");
                    continue;
                }
            }
            if let Err(e) = self.engine().remove_network(name).await {
                warn!(network = %name, error = %e, "cleanup failed");
                failures.push(format!("remove network {}: {}", name, e));
            }
        }
        for name in created.volumes.iter().rev() {
            let users = ContainerFilter::all().volume(name);
            if matches!(self.engine().list_containers(&users).await, Ok(c) if !c.is_empty()) {
                debug!(volume = %name, "volume in use, keeping it");
                continue;
            }
            if let Err(e) = self.engine().remove_volume(name, true).await {
                warn!(volume = %name, error = %e, "cleanup failed");
                failures.push(format!("remove volume {}: {}", name, e));
            }
        }

        failures
    }

    async fn ordered_containers(&self, project: &Project) -> Result<Vec<Container>> {
        let mut result = Vec::with_capacity(project.order.len());
        for service_name in &project.order {
            if let Some(service) = project.services.get(service_name) {
                result.push(
                    self.engine()
                        .inspect_container(&service.container_name)
                        .await?,
                );
            }
        }
        Ok(result)
    }
}

fn service_of(container: &Container) -> Option<&str> {
    match &container.started_with {
        StartedWith::Compose { service, .. } => Some(service),
        StartedWith::Direct => None,
    }
}

fn discard_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(file = %path.display(), error = %e, "could not remove compose file");
    }
    if let Some(dir) = path.parent() {
        // Only succeeds when empty
        let _ = std::fs::remove_dir(dir);
    }
}
