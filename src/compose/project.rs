//! Resolution of a compose document into concrete engine resources
//!
//! Applies the compose naming conventions: containers are
//! `<project>-<service>-1` unless `container_name` is set, and project
//! networks and volumes are `<project>_<key>` unless they are external or
//! carry an explicit `name`.

use super::config::{ComposeConfig, PortConfig, ServiceConfig, VolumeMount};
use super::graph;
use super::labels;
use super::parser::is_volume_name;
use crate::container::{
    Container, ContainerSpec, Mount, MountKind, NetworkAttachment, PortBinding, PortMap,
    RuntimeSettings,
};
use crate::error::{KeelError, Result};
use crate::network::{NetworkSpec, DEFAULT_NETWORK_DRIVER};
use crate::storage::{VolumeSpec, DEFAULT_VOLUME_DRIVER};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Key of the implicit network services join when they declare none
pub const DEFAULT_NETWORK_KEY: &str = "default";

/// A network the project needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectNetwork {
    /// Key in the compose file
    pub key: String,
    /// External networks must already exist and are never created
    pub external: bool,
    pub spec: NetworkSpec,
}

/// A volume the project needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectVolume {
    pub key: String,
    pub external: bool,
    pub spec: VolumeSpec,
}

/// Fully resolved service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub service: String,
    pub container_name: String,
    pub image: String,
    pub environment: Vec<String>,
    pub ports: PortMap,
    pub volumes: Vec<Mount>,
    pub networks: Vec<NetworkAttachment>,
    pub labels: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub runtime: RuntimeSettings,
}

impl ServiceSpec {
    /// SHA-256 over the canonical JSON form of the spec
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&canonical))
    }

    /// Whether `container` already runs this exact service definition.
    ///
    /// Containers created here carry the hash label. Others fall back to
    /// comparing the fields a compose file controls.
    pub fn is_current(&self, container: &Container) -> bool {
        if let Some(hash) = container.labels.get(labels::CONFIG_HASH) {
            return *hash == self.config_hash();
        }

        let env_declared = self
            .environment
            .iter()
            .all(|e| container.environment.contains(e));

        let published: BTreeMap<&String, &Vec<PortBinding>> = container
            .ports
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .collect();
        let wanted: BTreeMap<&String, &Vec<PortBinding>> = self
            .ports
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .collect();

        let networks: BTreeSet<&str> = self.networks.iter().map(|n| n.name.as_str()).collect();
        let mounts: BTreeSet<&str> = self.volumes.iter().map(|m| m.destination.as_str()).collect();
        let current_mounts: BTreeSet<&str> = container
            .volumes
            .iter()
            .map(|m| m.destination.as_str())
            .collect();

        container.image == self.image
            && env_declared
            && published == wanted
            && container.network_names() == networks
            && current_mounts == mounts
    }
}

/// A compose document resolved against a project name and directory
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Directory relative bind sources resolve against
    pub working_dir: PathBuf,
    /// Compose file(s) the project was loaded from
    pub config_files: Vec<PathBuf>,
    pub services: BTreeMap<String, ServiceSpec>,
    pub networks: Vec<ProjectNetwork>,
    pub volumes: Vec<ProjectVolume>,
    /// Deploy order
    pub order: Vec<String>,
}

impl Project {
    /// Resolve `config`. The document's own `name:` wins over `name`.
    pub fn resolve(
        config: &ComposeConfig,
        name: &str,
        working_dir: &Path,
        config_files: Vec<PathBuf>,
    ) -> Result<Self> {
        let project = normalize_project_name(config.name.as_deref().unwrap_or(name))?;
        let order = graph::deploy_order(config)?;

        let mut resolver = Resolver {
            project: &project,
            config,
            working_dir,
            used_networks: BTreeSet::new(),
        };

        let mut services = BTreeMap::new();
        for (key, service) in &config.services {
            let spec = resolver.service(key, service)?;
            services.insert(key.clone(), spec);
        }

        let networks = resolver.networks();
        let volumes = resolver.volumes();

        Ok(Self {
            name: project,
            working_dir: working_dir.to_path_buf(),
            config_files,
            services,
            networks,
            volumes,
            order,
        })
    }

    /// Creation spec for a service's container, with compose tracking
    /// labels attached
    pub fn container_spec(&self, service: &ServiceSpec) -> ContainerSpec {
        let config_files = self
            .config_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let spec = ContainerSpec {
            name: service.container_name.clone(),
            image: service.image.clone(),
            environment: service.environment.clone(),
            ports: service.ports.clone(),
            volumes: service.volumes.clone(),
            networks: service.networks.clone(),
            labels: service.labels.clone(),
            runtime: service.runtime.clone(),
        };

        spec.label(labels::PROJECT, &self.name)
            .label(labels::SERVICE, &service.service)
            .label(labels::WORKING_DIR, &self.working_dir.display().to_string())
            .label(labels::CONFIG_FILES, &config_files)
            .label(labels::CONTAINER_NUMBER, "1")
            .label(labels::ONEOFF, "False")
            .label(labels::CONFIG_HASH, &service.config_hash())
    }
}

/// Compose project names are lowercase letters, digits, `_` and `-`,
/// starting with a letter or digit
pub fn normalize_project_name(name: &str) -> Result<String> {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let normalized = normalized
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string();

    if normalized.is_empty() {
        return Err(KeelError::ComposeParse(format!(
            "'{}' is not a valid project name",
            name
        )));
    }
    Ok(normalized)
}

struct Resolver<'a> {
    project: &'a str,
    config: &'a ComposeConfig,
    working_dir: &'a Path,
    used_networks: BTreeSet<String>,
}

impl Resolver<'_> {
    fn service(&mut self, key: &str, service: &ServiceConfig) -> Result<ServiceSpec> {
        let image = service
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| {
                KeelError::ComposeParse(format!("Service '{}' must have 'image' specified", key))
            })?;

        let lookup = |k: &str| std::env::var(k).ok();
        let environment = service
            .environment
            .as_ref()
            .map(|e| crate::container::config::dedupe_environment(&e.entries(&lookup)))
            .unwrap_or_default();

        let mut ports = PortMap::new();
        for port in service.ports.iter().flatten() {
            for (key, binding) in parse_port(port)? {
                ports.entry(key).or_default().push(binding);
            }
        }
        for expose in service.expose.iter().flatten() {
            let key = crate::container::delta::normalize_port_key(&expose.to_string())
                .map_err(|e| KeelError::ComposeParse(format!("Service '{}': {}", key, e)))?;
            ports.entry(key).or_default();
        }
        for bindings in ports.values_mut() {
            bindings.sort();
            bindings.dedup();
        }

        let mut volumes = Vec::new();
        for mount in service.volumes.iter().flatten() {
            volumes.push(self.mount(key, mount)?);
        }
        volumes.sort_by(|a, b| a.destination.cmp(&b.destination));

        let mut networks = Vec::new();
        let declared = service
            .networks
            .as_ref()
            .map(|n| n.entries())
            .unwrap_or_else(|| vec![(DEFAULT_NETWORK_KEY.to_string(), Vec::new())]);
        for (net_key, aliases) in declared {
            let mut attachment = NetworkAttachment::new(&self.network_name(&net_key)).alias(key);
            for alias in &aliases {
                attachment = attachment.alias(alias);
            }
            attachment.aliases.sort();
            self.used_networks.insert(net_key);
            networks.push(attachment);
        }
        networks.sort();

        let runtime = RuntimeSettings {
            command: service.command.as_ref().map(|c| c.to_vec()),
            entrypoint: service.entrypoint.as_ref().map(|c| c.to_vec()),
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            restart_policy: service.restart.clone().filter(|r| r != "no"),
        };

        Ok(ServiceSpec {
            service: key.to_string(),
            container_name: service
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", self.project, key)),
            image,
            environment,
            ports,
            volumes,
            networks,
            labels: service
                .labels
                .as_ref()
                .map(|l| l.to_map())
                .unwrap_or_default(),
            depends_on: service.dependencies(),
            runtime,
        })
    }

    fn network_name(&self, key: &str) -> String {
        let declared = self.config.networks.get(key).and_then(|n| n.as_ref());
        match declared {
            Some(n) => match (&n.name, n.external.as_ref()) {
                (Some(name), _) => name.clone(),
                (None, Some(ext)) if ext.is_external() => {
                    ext.name().unwrap_or(key).to_string()
                }
                _ => format!("{}_{}", self.project, key),
            },
            None => format!("{}_{}", self.project, key),
        }
    }

    fn volume_name(&self, key: &str) -> String {
        let declared = self.config.volumes.get(key).and_then(|v| v.as_ref());
        match declared {
            Some(v) => match (&v.name, v.external.as_ref()) {
                (Some(name), _) => name.clone(),
                (None, Some(ext)) if ext.is_external() => {
                    ext.name().unwrap_or(key).to_string()
                }
                _ => format!("{}_{}", self.project, key),
            },
            None => format!("{}_{}", self.project, key),
        }
    }

    fn host_path(&self, source: &str) -> String {
        if let Some(rest) = source.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
        if source.starts_with('.') {
            let relative = source.trim_start_matches("./");
            let joined = if relative == "." || relative.is_empty() {
                self.working_dir.to_path_buf()
            } else {
                self.working_dir.join(relative)
            };
            return joined.display().to_string();
        }
        source.to_string()
    }

    fn mount(&self, service: &str, mount: &VolumeMount) -> Result<Mount> {
        let anonymous = || {
            KeelError::ComposeParse(format!(
                "Service '{}': anonymous volumes are not supported, name the volume",
                service
            ))
        };

        match mount {
            VolumeMount::Short(s) => {
                let parts: Vec<&str> = s.split(':').collect();
                let (source, destination, mode) = match parts.as_slice() {
                    [source, destination] => (*source, *destination, ""),
                    [source, destination, mode] => (*source, *destination, *mode),
                    _ => return Err(anonymous()),
                };

                let options: Vec<&str> = mode.split(',').filter(|o| !o.is_empty()).collect();
                let read_only = options.contains(&"ro");
                let mode = options
                    .iter()
                    .filter(|o| **o != "ro" && **o != "rw")
                    .copied()
                    .collect::<Vec<_>>()
                    .join(",");

                let mut resolved = if is_volume_name(source) {
                    Mount::named(&self.volume_name(source), destination)
                } else {
                    Mount::bind(&self.host_path(source), destination)
                };
                resolved.mode = mode;
                Ok(resolved.read_only(read_only))
            }
            VolumeMount::Long(l) => {
                let read_only = l.read_only.unwrap_or(false);
                let resolved = match l.mount_type.as_deref().unwrap_or("volume") {
                    "volume" => {
                        let source = l.source.as_deref().ok_or_else(anonymous)?;
                        Mount::named(&self.volume_name(source), &l.target)
                    }
                    "bind" => {
                        let source = l.source.as_deref().ok_or_else(|| {
                            KeelError::ComposeParse(format!(
                                "Service '{}': bind mount at '{}' has no source",
                                service, l.target
                            ))
                        })?;
                        Mount::bind(&self.host_path(source), &l.target)
                    }
                    "tmpfs" => Mount {
                        kind: MountKind::Tmpfs,
                        source: String::new(),
                        destination: l.target.clone(),
                        mode: String::new(),
                        read_only: false,
                    },
                    other => {
                        return Err(KeelError::ComposeParse(format!(
                            "Service '{}': mount type '{}' is not supported",
                            service, other
                        )))
                    }
                };
                Ok(resolved.read_only(read_only))
            }
        }
    }

    fn networks(&self) -> Vec<ProjectNetwork> {
        self.used_networks
            .iter()
            .map(|key| {
                let declared = self.config.networks.get(key).cloned().flatten();
                let external = declared
                    .as_ref()
                    .and_then(|n| n.external.as_ref())
                    .map_or(false, |e| e.is_external());

                let mut spec = NetworkSpec::new(&self.network_name(key))
                    .label(labels::PROJECT, self.project)
                    .label(labels::NETWORK, key);
                if let Some(n) = declared {
                    spec = spec
                        .driver(n.driver.as_deref().unwrap_or(DEFAULT_NETWORK_DRIVER))
                        .internal(n.internal.unwrap_or(false));
                    for (k, v) in n.driver_opts.unwrap_or_default() {
                        spec = spec.option(&k, &v);
                    }
                    for (k, v) in n.labels.map(|l| l.to_map()).unwrap_or_default() {
                        spec = spec.label(&k, &v);
                    }
                }

                ProjectNetwork {
                    key: key.clone(),
                    external,
                    spec,
                }
            })
            .collect()
    }

    fn volumes(&self) -> Vec<ProjectVolume> {
        self.config
            .volumes
            .iter()
            .map(|(key, declared)| {
                let external = declared
                    .as_ref()
                    .and_then(|v| v.external.as_ref())
                    .map_or(false, |e| e.is_external());

                let mut spec = VolumeSpec::new(&self.volume_name(key))
                    .label(labels::PROJECT, self.project)
                    .label(labels::VOLUME, key);
                if let Some(v) = declared {
                    spec = spec.driver(v.driver.as_deref().unwrap_or(DEFAULT_VOLUME_DRIVER));
                    for (k, val) in v.driver_opts.clone().unwrap_or_default() {
                        spec = spec.option(&k, &val);
                    }
                    for (k, val) in v.labels.as_ref().map(|l| l.to_map()).unwrap_or_default() {
                        spec = spec.label(&k, &val);
                    }
                }

                ProjectVolume {
                    key: key.clone(),
                    external,
                    spec,
                }
            })
            .collect()
    }
}

/// Expand one `ports:` entry into `(<port>/<proto>, binding)` pairs
fn parse_port(port: &PortConfig) -> Result<Vec<(String, PortBinding)>> {
    let invalid = |raw: &str| KeelError::ComposeParse(format!("invalid port mapping '{}'", raw));

    match port {
        PortConfig::Long(long) => {
            let proto = long.protocol.as_deref().unwrap_or("tcp");
            let key = crate::container::delta::normalize_port_key(&format!(
                "{}/{}",
                long.target, proto
            ))
            .map_err(|_| invalid(&long.target.to_string()))?;
            Ok(vec![(
                key,
                PortBinding {
                    host_ip: long.host_ip.clone().filter(|ip| !ip.is_empty()),
                    host_port: long.published.as_ref().map(|p| p.to_string()),
                },
            )])
        }
        PortConfig::Short(raw) => {
            let raw = raw.to_string();
            let (spec, proto) = raw.rsplit_once('/').unwrap_or((raw.as_str(), "tcp"));
            let parts: Vec<&str> = spec.split(':').collect();
            let (host_ip, host, container) = match parts.as_slice() {
                [container] => (None, None, *container),
                [host, container] => (None, Some(*host), *container),
                [ip, host, container] => (Some(*ip), Some(*host).filter(|h| !h.is_empty()), *container),
                _ => return Err(invalid(&raw)),
            };

            let container_ports = port_range(container).ok_or_else(|| invalid(&raw))?;
            let host_ports = match host {
                Some(h) => Some(port_range(h).ok_or_else(|| invalid(&raw))?),
                None => None,
            };
            if let Some(h) = &host_ports {
                if h.len() != container_ports.len() && h.len() != 1 {
                    return Err(invalid(&raw));
                }
            }

            container_ports
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let key = crate::container::delta::normalize_port_key(&format!("{}/{}", c, proto))
                        .map_err(|_| invalid(&raw))?;
                    let host_port = host_ports.as_ref().map(|h| {
                        if h.len() == 1 {
                            h[0].to_string()
                        } else {
                            h[i].to_string()
                        }
                    });
                    Ok((
                        key,
                        PortBinding {
                            host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
                            host_port,
                        },
                    ))
                })
                .collect()
        }
    }
}

/// `"80"` or `"8000-8002"`
fn port_range(raw: &str) -> Option<Vec<u16>> {
    match raw.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.parse().ok()?;
            let end: u16 = end.parse().ok()?;
            (start <= end).then(|| (start..=end).collect())
        }
        None => raw.parse().ok().map(|p| vec![p]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::StringOrNumber;
    use crate::compose::parser::ComposeParser;
    use crate::container::ContainerStatus;

    const SHOP: &str = r#"
name: Shop
services:
  web:
    image: nginx:1.25
    ports:
      - "8080:80"
      - "127.0.0.1:8443:443/tcp"
    volumes:
      - ./html:/usr/share/nginx/html:ro
    networks:
      - front
      - default
    depends_on: [api]
  api:
    image: shop/api:2
    environment:
      DATABASE_URL: postgres://db/shop
      WORKERS: 4
    command: ["serve", "--port", "9000"]
    expose:
      - 9000
    depends_on:
      db:
        condition: service_started
  db:
    image: postgres:16
    container_name: shop-database
    restart: unless-stopped
    volumes:
      - data:/var/lib/postgresql/data
networks:
  front:
    driver: bridge
  shared:
    external: true
volumes:
  data:
"#;

    fn project() -> Project {
        let config = ComposeParser::parse_str(SHOP).unwrap();
        Project::resolve(
            &config,
            "ignored",
            Path::new("/srv/stacks/shop"),
            vec![PathBuf::from("/srv/stacks/shop/docker-compose.yml")],
        )
        .unwrap()
    }

    #[test]
    fn test_project_naming() {
        let p = project();
        assert_eq!(p.name, "shop");
        assert_eq!(p.order, vec!["db", "api", "web"]);
        assert_eq!(p.services["web"].container_name, "shop-web-1");
        assert_eq!(p.services["db"].container_name, "shop-database");

        let networks: Vec<&str> = p.networks.iter().map(|n| n.spec.name.as_str()).collect();
        assert_eq!(networks, vec!["shop_default", "shop_front"]);

        assert_eq!(p.volumes.len(), 1);
        assert_eq!(p.volumes[0].spec.name, "shop_data");
        assert!(!p.volumes[0].external);
    }

    #[test]
    fn test_service_resolution() {
        let p = project();

        let web = &p.services["web"];
        assert_eq!(web.ports["80/tcp"], vec![PortBinding::host_port("8080")]);
        assert_eq!(
            web.ports["443/tcp"][0].host_ip.as_deref(),
            Some("127.0.0.1")
        );
        assert_eq!(web.volumes[0].kind, MountKind::Bind);
        assert_eq!(web.volumes[0].source, "/srv/stacks/shop/html");
        assert!(web.volumes[0].read_only);
        assert_eq!(
            web.networks,
            vec![
                NetworkAttachment::new("shop_default").alias("web"),
                NetworkAttachment::new("shop_front").alias("web"),
            ]
        );

        let api = &p.services["api"];
        assert_eq!(
            api.environment,
            vec!["DATABASE_URL=postgres://db/shop", "WORKERS=4"]
        );
        assert!(api.ports["9000/tcp"].is_empty());
        assert_eq!(
            api.runtime.command,
            Some(vec!["serve".to_string(), "--port".to_string(), "9000".to_string()])
        );

        let db = &p.services["db"];
        assert_eq!(db.volumes, vec![Mount::named("shop_data", "/var/lib/postgresql/data")]);
        assert_eq!(db.runtime.restart_policy.as_deref(), Some("unless-stopped"));
    }

    #[test]
    fn test_container_spec_labels() {
        let p = project();
        let spec = p.container_spec(&p.services["db"]);

        assert_eq!(spec.name, "shop-database");
        assert_eq!(spec.labels[labels::PROJECT], "shop");
        assert_eq!(spec.labels[labels::SERVICE], "db");
        assert_eq!(spec.labels[labels::WORKING_DIR], "/srv/stacks/shop");
        assert_eq!(
            spec.labels[labels::CONFIG_FILES],
            "/srv/stacks/shop/docker-compose.yml"
        );
        assert_eq!(spec.labels[labels::CONFIG_HASH], p.services["db"].config_hash());
    }

    #[test]
    fn test_config_hash_tracks_changes() {
        let p = project();
        let mut db = p.services["db"].clone();
        let before = db.config_hash();
        assert_eq!(before, p.services["db"].config_hash());

        db.image = "postgres:17".to_string();
        assert_ne!(before, db.config_hash());
    }

    fn running(spec: &ContainerSpec) -> Container {
        Container {
            id: "c".repeat(64),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Running,
            created: None,
            environment: spec.environment.clone(),
            ports: spec.ports.clone(),
            volumes: spec.volumes.clone(),
            networks: spec.networks.clone(),
            labels: spec.labels.clone(),
            runtime: spec.runtime.clone(),
            started_with: labels::started_with(&spec.labels),
        }
    }

    #[test]
    fn test_is_current_by_hash() {
        let p = project();
        let db = &p.services["db"];
        let container = running(&p.container_spec(db));
        assert!(db.is_current(&container));

        let mut changed = db.clone();
        changed.environment.push("POSTGRES_DB=shop".to_string());
        assert!(!changed.is_current(&container));
    }

    #[test]
    fn test_is_current_without_hash_label() {
        let p = project();
        let api = &p.services["api"];
        let mut container = running(&p.container_spec(api));
        container.labels.remove(labels::CONFIG_HASH);
        container.environment.push("PATH=/usr/local/bin".to_string());
        assert!(api.is_current(&container));

        container.image = "shop/api:1".to_string();
        assert!(!api.is_current(&container));
    }

    #[test]
    fn test_port_ranges() {
        let port = PortConfig::Short(StringOrNumber::String(
            "9000-9001:8000-8001/udp".to_string(),
        ));
        let parsed = parse_port(&port).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].0, "8001/udp");
        assert_eq!(parsed[1].1.host_port.as_deref(), Some("9001"));

        let bad = PortConfig::Short(StringOrNumber::String(
            "a:b:c:d".to_string(),
        ));
        assert!(parse_port(&bad).is_err());
    }

    #[test]
    fn test_normalize_project_name() {
        assert_eq!(normalize_project_name("My App").unwrap(), "myapp");
        assert_eq!(normalize_project_name("_x-1").unwrap(), "x-1");
        assert!(normalize_project_name("!!!").is_err());
    }
}
