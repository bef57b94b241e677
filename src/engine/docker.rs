//! Docker engine over the Engine API

use super::{ContainerFilter, Engine};
use crate::container::{Container, ContainerSpec, MountKind};
use crate::error::{EngineError, EngineResult, ResourceKind};
use crate::image::{loaded_reference, split_reference, BuildOutput, BuildRequest, Image};
use crate::network::{Network, NetworkSpec, DEFAULT_BRIDGE_NETWORK};
use crate::normalize;
use crate::storage::{Volume, VolumeSpec};
use crate::system::{DiskUsage, SystemInfo};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, RenameContainerOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, ImportImageOptions, ListImagesOptions,
    PushImageOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::models::{EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine backed by a Docker daemon
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect and verify the daemon answers.
    ///
    /// `host` accepts `unix://`, `tcp://` and `http://` addresses; `None`
    /// uses the platform default socket (or `DOCKER_HOST`).
    pub async fn connect(host: Option<&str>, timeout: Duration) -> EngineResult<Self> {
        let secs = timeout.as_secs();
        let docker = match host {
            None => Docker::connect_with_local_defaults().map(|d| d.with_timeout(timeout)),
            Some(addr) if addr.starts_with("unix://") => {
                Docker::connect_with_unix(addr, secs, API_DEFAULT_VERSION)
            }
            Some(addr) => Docker::connect_with_http(addr, secs, API_DEFAULT_VERSION),
        }
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        let engine = Self { docker };
        engine.ping().await?;

        info!(host = host.unwrap_or("default"), "Connected to Docker daemon");
        Ok(engine)
    }

    /// Wrap an existing client
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn attach_remaining_networks(&self, id: &str, spec: &ContainerSpec) -> EngineResult<()> {
        for attachment in spec.networks.iter().skip(1) {
            if let Err(e) = self
                .connect_network(&attachment.name, id, &attachment.aliases)
                .await
            {
                warn!(container = %spec.name, network = %attachment.name, error = %e, "Network attach failed, removing container");
                if let Err(cleanup) = self.remove_container(id, true).await {
                    warn!(container = %spec.name, error = %cleanup, "Failed to remove half-created container");
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unreachable(e.to_string()))
    }

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Container> {
        debug!(container = %id_or_name, "inspect container");
        let raw = self
            .docker
            .inspect_container(id_or_name, None)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id_or_name))?;
        normalize::container(&raw)
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> EngineResult<Vec<Container>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert("label".to_string(), filter.labels.clone());
        }
        if let Some(volume) = &filter.volume {
            filters.insert("volume".to_string(), vec![volume.clone()]);
        }
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }

        let options = ListContainersOptions {
            all: filter.all,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, "list"))?;

        // Summaries lack mounts and runtime settings, so inspect each one.
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect_container(&id).await {
                Ok(c) => containers.push(c),
                Err(e) if e.is_not_found() => debug!(container = %id, "vanished while listing"),
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let config = container_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify_create(e, spec))?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Engine warning on create");
        }

        self.attach_remaining_networks(&response.id, spec).await?;

        info!(container = %spec.name, id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        debug!(container = %id, "start container");
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ResourceKind::Container, id)),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        debug!(container = %id, timeout_secs = timeout.as_secs(), "stop container");
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ResourceKind::Container, id)),
        }
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        debug!(container = %id, "kill container");
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker
            .kill_container(id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn restart_container(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        debug!(container = %id, "restart container");
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        debug!(container = %id, force, "remove container");
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Container, id))
    }

    async fn rename_container(&self, id: &str, name: &str) -> EngineResult<()> {
        debug!(container = %id, name = %name, "rename container");
        let options = RenameContainerOptions { name };
        self.docker
            .rename_container(id, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Container, name))
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()> {
        debug!(network = %network, container = %container, "connect network");
        let options = ConnectNetworkOptions {
            container,
            endpoint_config: endpoint(network, aliases),
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, network))
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> EngineResult<()> {
        debug!(network = %network, container = %container, "disconnect network");
        let options = DisconnectNetworkOptions {
            container,
            force: false,
        };
        self.docker
            .disconnect_network(network, options)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, network))
    }

    async fn inspect_network(&self, id_or_name: &str) -> EngineResult<Network> {
        let raw = self
            .docker
            .inspect_network(id_or_name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, id_or_name))?;
        normalize::network(&raw)
    }

    async fn list_networks(&self) -> EngineResult<Vec<Network>> {
        let raw = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, "list"))?;
        raw.iter().map(normalize::network).collect()
    }

    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<String> {
        let options = CreateNetworkOptions {
            name: spec.name.as_str(),
            driver: spec.driver.as_str(),
            internal: spec.internal,
            check_duplicate: true,
            options: spec
                .options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            labels: spec
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, &spec.name))?;

        let id = response.id.unwrap_or_default();
        if id.is_empty() {
            return Err(EngineError::Protocol(format!(
                "no ID returned for network {}",
                spec.name
            )));
        }

        info!(network = %spec.name, id = %id, "Created network");
        Ok(id)
    }

    async fn remove_network(&self, id_or_name: &str) -> EngineResult<()> {
        self.docker
            .remove_network(id_or_name)
            .await
            .map_err(|e| classify(e, ResourceKind::Network, id_or_name))
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<Volume> {
        let raw = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, name))?;
        Ok(normalize::volume(&raw))
    }

    async fn list_volumes(&self) -> EngineResult<Vec<Volume>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, "list"))?;

        let mut volumes: Vec<Volume> = response
            .volumes
            .unwrap_or_default()
            .iter()
            .map(normalize::volume)
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<Volume> {
        let options = CreateVolumeOptions {
            name: spec.name.as_str(),
            driver: spec.driver.as_str(),
            driver_opts: spec
                .options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            labels: spec
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            ..Default::default()
        };

        let raw = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, &spec.name))?;

        info!(volume = %spec.name, "Created volume");
        Ok(normalize::volume(&raw))
    }

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
            .map_err(|e| classify(e, ResourceKind::Volume, name))
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<Image> {
        debug!(image = %reference, "inspect image");
        let raw = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| classify(e, ResourceKind::Image, reference))?;
        normalize::image_inspect(&raw)
    }

    async fn list_images(&self) -> EngineResult<Vec<Image>> {
        let raw = self
            .docker
            .list_images(None::<ListImagesOptions<String>>)
            .await
            .map_err(|e| classify(e, ResourceKind::Image, "list"))?;
        Ok(raw.iter().map(normalize::image_summary).collect())
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<()> {
        let (repository, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image: repository,
            tag,
            ..Default::default()
        };

        info!(image = %reference, "Pulling image");
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| stream_error(e, reference))?;
            if let Some(error) = info.error {
                return Err(EngineError::Api {
                    status: 500,
                    message: error,
                });
            }
            if let Some(status) = info.status {
                debug!(image = %reference, "{}", status);
            }
        }

        info!(image = %reference, "Pulled image");
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> EngineResult<()> {
        let (repository, tag) = split_reference(reference);
        let options = PushImageOptions { tag };

        info!(image = %reference, "Pushing image");
        let mut stream = self.docker.push_image(repository, Some(options), None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| stream_error(e, reference))?;
            if let Some(error) = info.error {
                return Err(EngineError::Api {
                    status: 500,
                    message: error,
                });
            }
            if let Some(status) = info.status {
                debug!(image = %reference, "{}", status);
            }
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()> {
        debug!(image = %source, repository = %repository, tag = %tag, "tag image");
        let options = TagImageOptions {
            repo: repository,
            tag,
        };
        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(|e| classify(e, ResourceKind::Image, source))
    }

    async fn remove_image(&self, reference: &str, force: bool) -> EngineResult<Vec<String>> {
        let options = RemoveImageOptions {
            force,
            noprune: false,
        };
        let items = self
            .docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| classify(e, ResourceKind::Image, reference))?;

        Ok(items
            .into_iter()
            .flat_map(|item| item.untagged.into_iter().chain(item.deleted))
            .collect())
    }

    async fn build_image(&self, request: &BuildRequest) -> EngineResult<BuildOutput> {
        let context = request
            .context_archive()
            .map_err(|e| EngineError::BuildFailed {
                tag: request.tag.clone(),
                message: e.to_string(),
            })?;

        let options = BuildImageOptions {
            dockerfile: crate::image::builder::DOCKERFILE_NAME.to_string(),
            t: request.tag.clone(),
            rm: true,
            forcerm: true,
            nocache: request.no_cache,
            buildargs: request
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };

        info!(tag = %request.tag, "Building image");
        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(context)));

        let mut output = BuildOutput::default();
        while let Some(item) = stream.next().await {
            let info = match item {
                Ok(info) => info,
                Err(BollardError::DockerStreamError { error }) => {
                    return Err(EngineError::BuildFailed {
                        tag: request.tag.clone(),
                        message: error,
                    })
                }
                Err(e) => return Err(classify(e, ResourceKind::Image, &request.tag)),
            };

            if let Some(error) = info.error {
                return Err(EngineError::BuildFailed {
                    tag: request.tag.clone(),
                    message: error,
                });
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %request.tag, "{}", line);
                    output.logs.push(line.to_string());
                }
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                output.image_id = Some(id);
            }
        }

        info!(tag = %request.tag, image_id = ?output.image_id, "Built image");
        Ok(output)
    }

    fn export_image<'a>(&'a self, reference: &'a str) -> BoxStream<'a, EngineResult<Bytes>> {
        self.docker
            .export_image(reference)
            .map(move |chunk| chunk.map_err(|e| classify(e, ResourceKind::Image, reference)))
            .boxed()
    }

    async fn import_image(&self, archive: Bytes) -> EngineResult<Vec<String>> {
        let options = ImportImageOptions { quiet: false };
        let mut stream = self.docker.import_image(options, archive, None);

        let mut loaded = Vec::new();
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| classify(e, ResourceKind::Image, "archive"))?;
            if let Some(error) = info.error {
                return Err(EngineError::Api {
                    status: 500,
                    message: error,
                });
            }
            if let Some(reference) = info.stream.as_deref().and_then(loaded_reference) {
                info!(image = %reference, "Loaded image");
                loaded.push(reference);
            }
        }
        Ok(loaded)
    }

    async fn system_info(&self) -> EngineResult<SystemInfo> {
        let raw = self
            .docker
            .info()
            .await
            .map_err(|e| classify(e, ResourceKind::Container, "system"))?;
        Ok(normalize::system_info(&raw))
    }

    async fn disk_usage(&self) -> EngineResult<DiskUsage> {
        let raw = self
            .docker
            .df()
            .await
            .map_err(|e| classify(e, ResourceKind::Container, "system"))?;
        Ok(normalize::disk_usage(&raw))
    }
}

/// A create that fails with 404 is about a missing image or network, never
/// the container being created
fn classify_create(err: BollardError, spec: &ContainerSpec) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("network") => EngineError::NotFound {
            kind: ResourceKind::Network,
            id: spec
                .networks
                .iter()
                .find(|n| message.contains(n.name.as_str()))
                .map_or(message.clone(), |n| n.name.clone()),
        },
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            kind: ResourceKind::Image,
            id: spec.image.clone(),
        },
        other => classify(other, ResourceKind::Container, &spec.name),
    }
}

/// Errors reported inside a pull or push progress stream
fn stream_error(err: BollardError, reference: &str) -> EngineError {
    match err {
        BollardError::DockerStreamError { error } => EngineError::Api {
            status: 500,
            message: error,
        },
        other => classify(other, ResourceKind::Image, reference),
    }
}

/// Map a client error onto the engine taxonomy
fn classify(err: BollardError, kind: ResourceKind, id: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound {
                kind,
                id: id.to_string(),
            },
            409 => EngineError::Conflict {
                kind,
                id: id.to_string(),
                message,
            },
            401 | 403 => EngineError::PermissionDenied(message),
            status => EngineError::Api { status, message },
        },
        BollardError::RequestTimeoutError => EngineError::Timeout {
            operation: "engine request".to_string(),
            id: id.to_string(),
        },
        e @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::SocketNotFoundError(_)) => EngineError::Unreachable(e.to_string()),
        other => EngineError::Protocol(other.to_string()),
    }
}

fn endpoint(network: &str, aliases: &[String]) -> EndpointSettings {
    // The default bridge network rejects aliases.
    let aliases = if network == DEFAULT_BRIDGE_NETWORK || aliases.is_empty() {
        None
    } else {
        Some(aliases.to_vec())
    };
    EndpointSettings {
        aliases,
        ..Default::default()
    }
}

/// Engine create body for a spec. Only the first network is attached here;
/// the rest are connected after create.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .keys()
        .map(|k| (k.clone(), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> = spec
        .ports
        .iter()
        .filter(|(_, bindings)| !bindings.is_empty())
        .map(|(key, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| bollard::models::PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.clone(),
                })
                .collect();
            (key.clone(), Some(bindings))
        })
        .collect();

    let mut binds = Vec::new();
    let mut tmpfs = HashMap::new();
    for mount in &spec.volumes {
        match mount.kind {
            MountKind::Named | MountKind::Bind => binds.push(bind_string(mount)),
            MountKind::Tmpfs => {
                tmpfs.insert(mount.destination.clone(), String::new());
            }
        }
    }

    let restart_policy = spec.runtime.restart_policy.as_deref().map(|name| RestartPolicy {
        name: Some(match name {
            "always" => RestartPolicyNameEnum::ALWAYS,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            _ => RestartPolicyNameEnum::NO,
        }),
        maximum_retry_count: None,
    });

    let first = spec.networks.first();

    let host_config = HostConfig {
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        binds: (!binds.is_empty()).then_some(binds),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        network_mode: first.map(|n| n.name.clone()),
        restart_policy,
        ..Default::default()
    };

    let networking_config = first.map(|n| {
        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(n.name.clone(), endpoint(&n.name, &n.aliases));
        NetworkingConfig { endpoints_config }
    });

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.environment.clone()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        cmd: spec.runtime.command.clone(),
        entrypoint: spec.runtime.entrypoint.clone(),
        working_dir: spec.runtime.working_dir.clone(),
        user: spec.runtime.user.clone(),
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}

/// `source:destination[:options]` bind entry
fn bind_string(mount: &crate::container::Mount) -> String {
    let mut options: Vec<&str> = mount
        .mode
        .split(',')
        .filter(|o| !o.is_empty() && *o != "rw" && *o != "ro")
        .collect();
    if mount.read_only {
        options.push("ro");
    }

    if options.is_empty() {
        format!("{}:{}", mount.source, mount.destination)
    } else {
        format!("{}:{}:{}", mount.source, mount.destination, options.join(","))
    }
}
