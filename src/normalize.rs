//! State normalizer
//!
//! Pure projections of raw engine inspection results into the entities of
//! this crate. No caching, no side effects: every call reflects the engine
//! response it was handed.

use crate::compose::labels;
use crate::container::{
    Container, ContainerStatus, Mount, MountKind, NetworkAttachment, PortBinding, PortMap,
    RuntimeSettings,
};
use crate::error::{EngineError, EngineResult};
use crate::image::Image;
use crate::network::Network;
use crate::storage::volume::{bind_device, Volume};
use crate::system::{ContainerCounts, DiskUsage, SystemInfo};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, ImageInspect, ImageSummary,
    MountPoint, MountPointTypeEnum, RestartPolicyNameEnum, SystemDataUsageResponse,
    VolumeScopeEnum,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Project a container inspection
pub fn container(raw: &ContainerInspectResponse) -> EngineResult<Container> {
    let id = raw
        .id
        .clone()
        .ok_or_else(|| EngineError::Protocol("container inspection without Id".to_string()))?;

    let name = raw
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();

    let config = raw.config.clone().unwrap_or_default();

    let image = config
        .image
        .clone()
        .or_else(|| raw.image.clone())
        .unwrap_or_default();

    let status = raw
        .state
        .as_ref()
        .and_then(|s| s.status)
        .map(status)
        .unwrap_or(ContainerStatus::Created);

    let created = timestamp(raw.created.as_deref());

    let labels: BTreeMap<String, String> = config.labels.clone().unwrap_or_default().into_iter().collect();
    let started_with = labels::started_with(&labels);

    let exposed: Vec<String> = config
        .exposed_ports
        .as_ref()
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();

    let networks = raw
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.as_ref())
        .map(|n| attachments(n, &id))
        .unwrap_or_default();

    let mut volumes: Vec<Mount> = raw
        .mounts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(mount)
        .collect();
    volumes.sort_by(|a, b| a.destination.cmp(&b.destination));

    Ok(Container {
        name,
        image,
        status,
        created,
        environment: config.env.clone().unwrap_or_default(),
        ports: ports(&exposed, raw.host_config.as_ref()),
        volumes,
        networks,
        runtime: runtime(&config, raw.host_config.as_ref()),
        labels,
        started_with,
        id,
    })
}

/// Project a network inspection or list entry
pub fn network(raw: &bollard::models::Network) -> EngineResult<Network> {
    let id = raw
        .id
        .clone()
        .ok_or_else(|| EngineError::Protocol("network without Id".to_string()))?;

    let mut containers: Vec<String> = raw
        .containers
        .as_ref()
        .map(|c| c.keys().cloned().collect())
        .unwrap_or_default();
    containers.sort();

    Ok(Network {
        name: raw.name.clone().unwrap_or_else(|| id.clone()),
        driver: raw.driver.clone().unwrap_or_default(),
        scope: raw.scope.clone().unwrap_or_else(|| "local".to_string()),
        internal: raw.internal.unwrap_or(false),
        labels: raw.labels.clone().unwrap_or_default().into_iter().collect(),
        containers,
        id,
    })
}

/// Project a volume inspection or list entry
pub fn volume(raw: &bollard::models::Volume) -> Volume {
    let options: BTreeMap<String, String> = raw.options.clone().into_iter().collect();
    let host_path = bind_device(&options).map(str::to_string);
    let is_bind_mount = host_path.is_some();

    let mountpoint = if is_bind_mount || raw.mountpoint.is_empty() {
        None
    } else {
        Some(raw.mountpoint.clone())
    };

    let scope = match raw.scope {
        Some(VolumeScopeEnum::GLOBAL) => "global",
        _ => "local",
    };

    Volume {
        name: raw.name.clone(),
        driver: raw.driver.clone(),
        mountpoint,
        host_path,
        is_bind_mount,
        scope: scope.to_string(),
        labels: raw.labels.clone().into_iter().collect(),
        options,
    }
}

/// Project an image list entry
pub fn image_summary(raw: &ImageSummary) -> Image {
    Image {
        id: raw.id.clone(),
        tags: raw
            .repo_tags
            .iter()
            .filter(|t| t.as_str() != "<none>:<none>")
            .cloned()
            .collect(),
        size: bytes(raw.size),
        created: DateTime::from_timestamp(raw.created, 0),
        // -1 means the engine did not count
        containers: u64::try_from(raw.containers).ok(),
    }
}

/// Project an image inspection
pub fn image_inspect(raw: &ImageInspect) -> EngineResult<Image> {
    let id = raw
        .id
        .clone()
        .ok_or_else(|| EngineError::Protocol("image inspection without Id".to_string()))?;

    Ok(Image {
        id,
        tags: raw.repo_tags.clone().unwrap_or_default(),
        size: bytes(raw.size.unwrap_or_default()),
        created: timestamp(raw.created.as_deref()),
        containers: None,
    })
}

pub fn system_info(raw: &bollard::models::SystemInfo) -> SystemInfo {
    let count = |v: Option<i64>| bytes(v.unwrap_or_default());
    SystemInfo {
        name: raw.name.clone(),
        server_version: raw.server_version.clone(),
        operating_system: raw.operating_system.clone(),
        architecture: raw.architecture.clone(),
        kernel_version: raw.kernel_version.clone(),
        storage_driver: raw.driver.clone(),
        cpus: count(raw.ncpu),
        memory: count(raw.mem_total),
        containers: ContainerCounts {
            total: count(raw.containers),
            running: count(raw.containers_running),
            paused: count(raw.containers_paused),
            stopped: count(raw.containers_stopped),
        },
        images: count(raw.images),
    }
}

/// Totals per resource kind. An item is reclaimable when nothing uses it.
pub fn disk_usage(raw: &SystemDataUsageResponse) -> DiskUsage {
    let mut usage = DiskUsage::default();

    for image in raw.images.iter().flatten() {
        usage.images.add(bytes(image.size), image.containers != 0);
    }
    for container in raw.containers.iter().flatten() {
        let running = container.state.as_deref() == Some("running");
        usage
            .containers
            .add(bytes(container.size_rw.unwrap_or_default()), running);
    }
    for volume in raw.volumes.iter().flatten() {
        let (size, refs) = volume
            .usage_data
            .as_ref()
            .map_or((0, 0), |u| (u.size, u.ref_count));
        usage.volumes.add(bytes(size), refs != 0);
    }
    for cache in raw.build_cache.iter().flatten() {
        usage.build_cache.add(
            bytes(cache.size.unwrap_or_default()),
            cache.in_use.unwrap_or(false),
        );
    }

    usage
}

fn timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|v| v.with_timezone(&Utc))
}

/// Engine sizes use -1 for unknown
fn bytes(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn status(raw: ContainerStateStatusEnum) -> ContainerStatus {
    match raw {
        ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
        ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
        ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
        ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
        ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
        _ => ContainerStatus::Created,
    }
}

/// Configured bindings, not runtime ones: a stopped container has no
/// runtime port state but must keep its bindings across a recreate.
fn ports(exposed: &[String], host: Option<&HostConfig>) -> PortMap {
    let mut result = PortMap::new();

    for key in exposed {
        result.entry(key.clone()).or_default();
    }

    let bindings = host.and_then(|h| h.port_bindings.as_ref());
    for (key, list) in bindings.into_iter().flatten() {
        let entry = result.entry(key.clone()).or_default();
        for binding in list.iter().flatten() {
            entry.push(PortBinding {
                host_ip: non_empty(binding.host_ip.as_deref()),
                host_port: non_empty(binding.host_port.as_deref()),
            });
        }
        entry.sort();
        entry.dedup();
    }

    result
}

fn mount(raw: &MountPoint) -> Option<Mount> {
    let kind = match raw.typ {
        Some(MountPointTypeEnum::VOLUME) => MountKind::Named,
        Some(MountPointTypeEnum::BIND) => MountKind::Bind,
        Some(MountPointTypeEnum::TMPFS) => MountKind::Tmpfs,
        ref other => {
            tracing::debug!(mount_type = ?other, "skipping unsupported mount type");
            return None;
        }
    };

    let source = match kind {
        MountKind::Named => raw.name.clone().or_else(|| raw.source.clone()),
        MountKind::Bind => raw.source.clone(),
        MountKind::Tmpfs => None,
    }
    .unwrap_or_default();

    Some(Mount {
        kind,
        source,
        destination: raw.destination.clone().unwrap_or_default(),
        mode: raw.mode.clone().unwrap_or_default(),
        read_only: !raw.rw.unwrap_or(true),
    })
}

fn attachments(
    raw: &HashMap<String, bollard::models::EndpointSettings>,
    container_id: &str,
) -> Vec<NetworkAttachment> {
    let short_id = &container_id[..container_id.len().min(12)];

    let mut result: Vec<NetworkAttachment> = raw
        .iter()
        .map(|(name, endpoint)| {
            let mut aliases: Vec<String> = endpoint
                .aliases
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|a| a != short_id && a != container_id)
                .collect();
            aliases.sort();
            aliases.dedup();
            NetworkAttachment {
                name: name.clone(),
                aliases,
            }
        })
        .collect();

    result.sort();
    result
}

fn runtime(config: &bollard::models::ContainerConfig, host: Option<&HostConfig>) -> RuntimeSettings {
    let restart_policy = host
        .and_then(|h| h.restart_policy.as_ref())
        .and_then(|p| p.name)
        .and_then(|name| match name {
            RestartPolicyNameEnum::ALWAYS => Some("always"),
            RestartPolicyNameEnum::UNLESS_STOPPED => Some("unless-stopped"),
            RestartPolicyNameEnum::ON_FAILURE => Some("on-failure"),
            _ => None,
        })
        .map(str::to_string);

    RuntimeSettings {
        command: config.cmd.clone(),
        entrypoint: config.entrypoint.clone(),
        working_dir: non_empty(config.working_dir.as_deref()),
        user: non_empty(config.user.as_deref()),
        restart_policy,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
