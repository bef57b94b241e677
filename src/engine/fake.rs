//! In-memory engine for tests
//!
//! Keeps containers, networks, volumes and local images in maps, records
//! every mutating call in order, and can be told to fail specific
//! operations. Any image not present locally can be pulled unless marked
//! unpullable.

use super::{ContainerFilter, Engine};
use crate::compose::labels;
use crate::container::{Container, ContainerSpec, ContainerStatus, MountKind};
use crate::error::{EngineError, EngineResult, ResourceKind};
use crate::image::{loaded_reference, BuildOutput, BuildRequest, Image};
use crate::network::{Network, NetworkSpec, PREDEFINED_NETWORKS};
use crate::storage::volume::bind_device;
use crate::storage::{Volume, VolumeSpec};
use crate::system::{ContainerCounts, DiskUsage, SystemInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    next_id: u64,
    containers: BTreeMap<String, Container>,
    networks: BTreeMap<String, Network>,
    volumes: BTreeMap<String, Volume>,
    /// Local image references and the image ID each points at
    images: BTreeMap<String, String>,
    calls: Vec<String>,
    unpullable: HashSet<String>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    exit_on_start: HashSet<String>,
    fail_remove: HashSet<String>,
    fail_rename: HashSet<String>,
    stops_time_out: bool,
    fail_build: bool,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

impl State {
    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }

    fn find_container(&self, id_or_name: &str) -> EngineResult<String> {
        if self.containers.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.name == id_or_name || (id_or_name.len() >= 4 && c.id.starts_with(id_or_name)))
            .map(|c| c.id.clone())
            .ok_or_else(|| EngineError::NotFound {
                kind: ResourceKind::Container,
                id: id_or_name.to_string(),
            })
    }

    fn container_mut(&mut self, id_or_name: &str) -> EngineResult<&mut Container> {
        let id = self.find_container(id_or_name)?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::Protocol(format!("container {} vanished", id)))
    }

    fn find_network(&self, id_or_name: &str) -> EngineResult<String> {
        self.networks
            .values()
            .find(|n| n.name == id_or_name || n.id == id_or_name)
            .map(|n| n.name.clone())
            .ok_or_else(|| EngineError::NotFound {
                kind: ResourceKind::Network,
                id: id_or_name.to_string(),
            })
    }

    fn network_view(&self, name: &str) -> Option<Network> {
        let mut network = self.networks.get(name)?.clone();
        network.containers = self
            .containers
            .values()
            .filter(|c| c.networks.iter().any(|n| n.name == name))
            .map(|c| c.id.clone())
            .collect();
        Some(network)
    }

    /// Make `reference` local. Returns its image ID.
    fn add_image(&mut self, reference: &str) -> String {
        if let Some(id) = self.images.get(reference) {
            return id.clone();
        }
        let id = format!("sha256:{}", self.id());
        self.images.insert(reference.to_string(), id.clone());
        id
    }

    fn image_id(&self, reference: &str) -> EngineResult<String> {
        self.images
            .get(reference)
            .cloned()
            .or_else(|| {
                self.images
                    .values()
                    .find(|id| id.as_str() == reference)
                    .cloned()
            })
            .ok_or_else(|| EngineError::NotFound {
                kind: ResourceKind::Image,
                id: reference.to_string(),
            })
    }

    fn image_view(&self, id: &str) -> Image {
        Image {
            id: id.to_string(),
            tags: self
                .images
                .iter()
                .filter(|(_, i)| i.as_str() == id)
                .map(|(r, _)| r.clone())
                .collect(),
            size: 1024,
            created: None,
            containers: Some(
                self.containers
                    .values()
                    .filter(|c| self.images.get(&c.image).map(String::as_str) == Some(id))
                    .count() as u64,
            ),
        }
    }

    fn ensure_volume(&mut self, name: &str) {
        if !self.volumes.contains_key(name) {
            self.volumes.insert(name.to_string(), volume_from(&VolumeSpec::new(name)));
        }
    }

    fn name_of(&self, id: &str) -> String {
        self.containers
            .get(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

fn volume_from(spec: &VolumeSpec) -> Volume {
    let host_path = bind_device(&spec.options).map(str::to_string);
    Volume {
        name: spec.name.clone(),
        driver: spec.driver.clone(),
        mountpoint: match host_path {
            Some(_) => None,
            None => Some(format!("/var/lib/docker/volumes/{}/_data", spec.name)),
        },
        is_bind_mount: host_path.is_some(),
        host_path,
        scope: "local".to_string(),
        options: spec.options.clone(),
        labels: spec.labels.clone(),
    }
}

/// In-memory engine double
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    /// Engine with the predefined networks in place
    pub fn new() -> Self {
        let engine = Self::default();
        {
            let mut state = engine.lock();
            for name in PREDEFINED_NETWORKS {
                let id = state.id();
                state.networks.insert(
                    name.to_string(),
                    Network {
                        id,
                        name: name.to_string(),
                        driver: name.to_string(),
                        scope: "local".to_string(),
                        internal: false,
                        labels: BTreeMap::new(),
                        containers: Vec::new(),
                    },
                );
            }
        }
        engine
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    /// Create a network outside the call log
    pub fn with_network(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            let id = state.id();
            state.networks.insert(
                name.to_string(),
                Network {
                    id,
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    scope: "local".to_string(),
                    internal: false,
                    labels: BTreeMap::new(),
                    containers: Vec::new(),
                },
            );
        }
        self
    }

    /// Create a volume outside the call log
    pub fn with_volume(self, name: &str) -> Self {
        self.lock().ensure_volume(name);
        self
    }

    /// Make an image local
    pub fn with_image(self, reference: &str) -> Self {
        self.lock().add_image(reference);
        self
    }

    /// Put a container in place outside the call log. Returns its ID.
    pub fn seed(&self, spec: &ContainerSpec, running: bool) -> String {
        let mut state = self.lock();
        let id = state.id();
        for network in &spec.networks {
            if !state.networks.contains_key(&network.name) {
                let net_id = state.id();
                state.networks.insert(
                    network.name.clone(),
                    Network {
                        id: net_id,
                        name: network.name.clone(),
                        driver: "bridge".to_string(),
                        scope: "local".to_string(),
                        internal: false,
                        labels: BTreeMap::new(),
                        containers: Vec::new(),
                    },
                );
            }
        }
        for mount in spec.volumes.iter().filter(|m| m.kind == MountKind::Named) {
            state.ensure_volume(&mount.source);
        }
        state.add_image(&spec.image);
        let mut container = container_from(&id, spec);
        if running {
            container.status = ContainerStatus::Running;
        }
        state.containers.insert(id.clone(), container);
        id
    }

    /// Fail `create_container` for specs using `image`
    pub fn fail_create_for(&self, image: &str) {
        self.lock().fail_create.insert(image.to_string());
    }

    /// Fail `start_container` for containers using `image`
    pub fn fail_start_for(&self, image: &str) {
        self.lock().fail_start.insert(image.to_string());
    }

    /// Containers using `image` exit right after a successful start
    pub fn exit_on_start_for(&self, image: &str) {
        self.lock().exit_on_start.insert(image.to_string());
    }

    /// Fail `remove_container` for the container called `name`
    pub fn fail_remove_for(&self, name: &str) {
        self.lock().fail_remove.insert(name.to_string());
    }

    /// Fail `rename_container` to the name `name`
    pub fn fail_rename_for(&self, name: &str) {
        self.lock().fail_rename.insert(name.to_string());
    }

    /// Pulling `reference` fails as if the registry does not know it
    pub fn unpullable(&self, reference: &str) {
        self.lock().unpullable.insert(reference.to_string());
    }

    /// Graceful stops fail with the client's request timeout and leave the
    /// container running
    pub fn time_out_stops(&self) {
        self.lock().stops_time_out = true;
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.lock().images.contains_key(reference)
    }

    pub fn fail_builds(&self) {
        self.lock().fail_build = true;
    }

    /// Delay every start, holding the caller mid-transaction
    pub fn delay_start(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    /// Delay every graceful stop
    pub fn delay_stop(&self, delay: Duration) {
        self.lock().stop_delay = Some(delay);
    }

    /// Mutating calls in the order they were issued
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Snapshot of every container, sorted by name
    pub fn containers(&self) -> Vec<Container> {
        let mut all: Vec<Container> = self.lock().containers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn container_named(&self, name: &str) -> Option<Container> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains_key(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }
}

fn container_from(id: &str, spec: &ContainerSpec) -> Container {
    let mut networks = spec.networks.clone();
    networks.sort();
    let mut volumes = spec.volumes.clone();
    volumes.sort_by(|a, b| a.destination.cmp(&b.destination));

    Container {
        id: id.to_string(),
        name: spec.name.clone(),
        image: spec.image.clone(),
        status: ContainerStatus::Created,
        created: Some(chrono::Utc::now()),
        environment: spec.environment.clone(),
        ports: spec.ports.clone(),
        volumes,
        networks,
        labels: spec.labels.clone(),
        runtime: spec.runtime.clone(),
        started_with: labels::started_with(&spec.labels),
    }
}

fn matches_filter(container: &Container, filter: &ContainerFilter) -> bool {
    if !filter.all && !container.is_running() {
        return false;
    }
    let labels_match = filter.labels.iter().all(|f| match f.split_once('=') {
        Some((k, v)) => container.labels.get(k).map(String::as_str) == Some(v),
        None => container.labels.contains_key(f.as_str()),
    });
    let volume_match = filter
        .volume
        .as_deref()
        .map_or(true, |v| container.mounts_volume(v));
    let name_match = filter
        .name
        .as_deref()
        .map_or(true, |n| container.name.contains(n));
    labels_match && volume_match && name_match
}

#[async_trait]
impl Engine for FakeEngine {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Container> {
        let state = self.lock();
        let id = state.find_container(id_or_name)?;
        state
            .containers
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Protocol(format!("container {} vanished", id)))
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> EngineResult<Vec<Container>> {
        let mut found: Vec<Container> = self
            .lock()
            .containers
            .values()
            .filter(|c| matches_filter(c, filter))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut state = self.lock();
        state.calls.push(format!("create:{}", spec.name));

        if state.fail_create.contains(&spec.image) || !state.images.contains_key(&spec.image) {
            return Err(EngineError::NotFound {
                kind: ResourceKind::Image,
                id: spec.image.clone(),
            });
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Container,
                id: spec.name.clone(),
                message: "name already in use".to_string(),
            });
        }
        for network in &spec.networks {
            state.find_network(&network.name)?;
        }
        for mount in spec.volumes.iter().filter(|m| m.kind == MountKind::Named) {
            state.ensure_volume(&mount.source);
        }

        let id = state.id();
        let container = container_from(&id, spec);
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let delay = self.lock().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let id = state.find_container(id)?;
        let name = state.name_of(&id);
        state.calls.push(format!("start:{}", name));

        let image = state.container_mut(&id)?.image.clone();
        if state.fail_start.contains(&image) {
            return Err(EngineError::Api {
                status: 500,
                message: "driver failed programming external connectivity: port is already allocated"
                    .to_string(),
            });
        }
        let exits = state.exit_on_start.contains(&image);
        let container = state.container_mut(&id)?;
        container.status = if exits {
            ContainerStatus::Exited
        } else {
            ContainerStatus::Running
        };
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> EngineResult<()> {
        let delay = self.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let id = state.find_container(id)?;
        let name = state.name_of(&id);
        state.calls.push(format!("stop:{}", name));
        if state.stops_time_out {
            return Err(EngineError::Timeout {
                operation: "engine request".to_string(),
                id,
            });
        }
        state.container_mut(&id)?.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let id = state.find_container(id)?;
        let name = state.name_of(&id);
        state.calls.push(format!("kill:{}", name));
        let container = state.container_mut(&id)?;
        if !container.is_running() {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Container,
                id: name,
                message: "container is not running".to_string(),
            });
        }
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> EngineResult<()> {
        let mut state = self.lock();
        let id = state.find_container(id)?;
        let name = state.name_of(&id);
        state.calls.push(format!("restart:{}", name));
        state.container_mut(&id)?.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        let mut state = self.lock();
        let id = state.find_container(id)?;
        let name = state.name_of(&id);
        state.calls.push(format!("remove:{}", name));

        if state.fail_remove.contains(&name) {
            return Err(EngineError::Api {
                status: 500,
                message: "driver failed to remove root filesystem".to_string(),
            });
        }
        let running = state.container_mut(&id)?.is_running();
        if running && !force {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Container,
                id: name,
                message: "cannot remove a running container".to_string(),
            });
        }
        state.containers.remove(&id);
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let id = state.find_container(id)?;
        let old = state.name_of(&id);
        state.calls.push(format!("rename:{}->{}", old, name));

        if state.fail_rename.contains(name) {
            return Err(EngineError::Api {
                status: 500,
                message: "Error when allocating new name".to_string(),
            });
        }
        if state.containers.values().any(|c| c.name == name && c.id != id) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Container,
                id: name.to_string(),
                message: "name already in use".to_string(),
            });
        }
        state.container_mut(&id)?.name = name.to_string();
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()> {
        let mut state = self.lock();
        let network = state.find_network(network)?;
        let id = state.find_container(container)?;
        let name = state.name_of(&id);
        state.calls.push(format!("connect:{}:{}", network, name));

        let target = state.container_mut(&id)?;
        if target.networks.iter().any(|n| n.name == network) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Network,
                id: network,
                message: format!("endpoint with name {} already exists", name),
            });
        }
        target.networks.push(crate::container::NetworkAttachment {
            name: network,
            aliases: aliases.to_vec(),
        });
        target.networks.sort();
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let network = state.find_network(network)?;
        let id = state.find_container(container)?;
        let name = state.name_of(&id);
        state.calls.push(format!("disconnect:{}:{}", network, name));

        let target = state.container_mut(&id)?;
        let before = target.networks.len();
        target.networks.retain(|n| n.name != network);
        if target.networks.len() == before {
            return Err(EngineError::NotFound {
                kind: ResourceKind::Network,
                id: format!("{} endpoint for {}", network, name),
            });
        }
        Ok(())
    }

    async fn inspect_network(&self, id_or_name: &str) -> EngineResult<Network> {
        let state = self.lock();
        let name = state.find_network(id_or_name)?;
        state
            .network_view(&name)
            .ok_or_else(|| EngineError::Protocol(format!("network {} vanished", name)))
    }

    async fn list_networks(&self) -> EngineResult<Vec<Network>> {
        let state = self.lock();
        Ok(state
            .networks
            .keys()
            .filter_map(|n| state.network_view(n))
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<String> {
        let mut state = self.lock();
        state.calls.push(format!("create_network:{}", spec.name));

        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Network,
                id: spec.name.clone(),
                message: "network already exists".to_string(),
            });
        }
        let id = state.id();
        state.networks.insert(
            spec.name.clone(),
            Network {
                id: id.clone(),
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                scope: "local".to_string(),
                internal: spec.internal,
                labels: spec.labels.clone(),
                containers: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, id_or_name: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let name = state.find_network(id_or_name)?;
        state.calls.push(format!("remove_network:{}", name));

        if PREDEFINED_NETWORKS.contains(&name.as_str()) {
            return Err(EngineError::PermissionDenied(format!(
                "{} is a pre-defined network and cannot be removed",
                name
            )));
        }
        let in_use = state
            .network_view(&name)
            .map_or(false, |n| !n.containers.is_empty());
        if in_use {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Network,
                id: name,
                message: "network has active endpoints".to_string(),
            });
        }
        state.networks.remove(&name);
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<Volume> {
        self.lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: ResourceKind::Volume,
                id: name.to_string(),
            })
    }

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>> {
        Ok(self.lock().volumes.values().cloned().collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<Volume> {
        let mut state = self.lock();
        state.calls.push(format!("create_volume:{}", spec.name));
        let volume = state
            .volumes
            .entry(spec.name.clone())
            .or_insert_with(|| volume_from(spec));
        Ok(volume.clone())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("remove_volume:{}", name));

        if !state.volumes.contains_key(name) {
            return Err(EngineError::NotFound {
                kind: ResourceKind::Volume,
                id: name.to_string(),
            });
        }
        if let Some(user) = state.containers.values().find(|c| c.mounts_volume(name)) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Volume,
                id: name.to_string(),
                message: format!("volume is in use by {}", user.id),
            });
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<Image> {
        let state = self.lock();
        let id = state.image_id(reference)?;
        Ok(state.image_view(&id))
    }

    async fn list_images(&self) -> EngineResult<Vec<Image>> {
        let state = self.lock();
        let mut ids: Vec<&String> = state.images.values().collect();
        ids.sort();
        ids.dedup();
        Ok(ids.into_iter().map(|id| state.image_view(id)).collect())
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("pull:{}", reference));
        if state.unpullable.contains(reference) {
            return Err(EngineError::NotFound {
                kind: ResourceKind::Image,
                id: reference.to_string(),
            });
        }
        state.add_image(reference);
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("push:{}", reference));
        state.image_id(reference).map(|_| ())
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let target = format!("{}:{}", repository, tag);
        state.calls.push(format!("tag:{}->{}", source, target));
        let id = state.image_id(source)?;
        state.images.insert(target, id);
        Ok(())
    }

    async fn remove_image(&self, reference: &str, force: bool) -> EngineResult<Vec<String>> {
        let mut state = self.lock();
        state.calls.push(format!("remove_image:{}", reference));
        let id = state.image_id(reference)?;

        if let Some(user) = state.containers.values().find(|c| c.image == reference) {
            if !force {
                return Err(EngineError::Conflict {
                    kind: ResourceKind::Image,
                    id: reference.to_string(),
                    message: format!("image is being used by container {}", user.id),
                });
            }
        }

        let mut removed = Vec::new();
        if state.images.remove(reference).is_some() {
            removed.push(reference.to_string());
        } else {
            // Removing by ID drops every tag
            let tags: Vec<String> = state
                .images
                .iter()
                .filter(|(_, i)| **i == id)
                .map(|(r, _)| r.clone())
                .collect();
            for tag in tags {
                state.images.remove(&tag);
                removed.push(tag);
            }
        }
        if !state.images.values().any(|i| *i == id) {
            removed.push(id);
        }
        Ok(removed)
    }

    async fn build_image(&self, request: &BuildRequest) -> EngineResult<BuildOutput> {
        let mut state = self.lock();
        state.calls.push(format!("build:{}", request.tag));

        if state.fail_build {
            return Err(EngineError::BuildFailed {
                tag: request.tag.clone(),
                message: "The command '/bin/sh -c false' returned a non-zero code: 1".to_string(),
            });
        }
        let image_id = state.add_image(&request.tag);
        Ok(BuildOutput {
            image_id: Some(image_id),
            logs: request
                .dockerfile
                .lines()
                .filter(|l| !l.trim().is_empty())
                .enumerate()
                .map(|(i, l)| format!("Step {} : {}", i + 1, l.trim()))
                .collect(),
        })
    }

    fn export_image<'a>(&'a self, reference: &'a str) -> BoxStream<'a, EngineResult<Bytes>> {
        if !self.lock().images.contains_key(reference) {
            return stream::iter(vec![Err(EngineError::NotFound {
                kind: ResourceKind::Image,
                id: reference.to_string(),
            })])
            .boxed();
        }
        let chunks = vec![
            Ok(Bytes::from(format!("Loaded image: {}\n", reference))),
            Ok(Bytes::from_static(b"layer-data\n")),
        ];
        stream::iter(chunks).boxed()
    }

    /// Treats the archive as text and loads every `Loaded image:` line
    async fn import_image(&self, archive: Bytes) -> EngineResult<Vec<String>> {
        let text = String::from_utf8_lossy(&archive);
        let loaded: Vec<String> = text.lines().filter_map(loaded_reference).collect();
        let mut state = self.lock();
        state.calls.push("import".to_string());
        for reference in &loaded {
            state.add_image(reference);
        }
        Ok(loaded)
    }

    async fn system_info(&self) -> EngineResult<SystemInfo> {
        let state = self.lock();
        let running = state.containers.values().filter(|c| c.is_running()).count() as u64;
        let total = state.containers.len() as u64;
        Ok(SystemInfo {
            name: Some("fake".to_string()),
            server_version: Some("27.0.0".to_string()),
            containers: ContainerCounts {
                total,
                running,
                paused: 0,
                stopped: total - running,
            },
            images: state.images.values().collect::<HashSet<_>>().len() as u64,
            ..SystemInfo::default()
        })
    }

    async fn disk_usage(&self) -> EngineResult<DiskUsage> {
        let state = self.lock();
        let mut usage = DiskUsage::default();
        let ids: HashSet<&String> = state.images.values().collect();
        for id in ids {
            let view = state.image_view(id);
            usage.images.add(view.size, view.containers.unwrap_or(0) > 0);
        }
        for container in state.containers.values() {
            usage.containers.add(0, container.is_running());
        }
        for volume in state.volumes.keys() {
            let used = state.containers.values().any(|c| c.mounts_volume(volume));
            usage.volumes.add(0, used);
        }
        Ok(usage)
    }
}
