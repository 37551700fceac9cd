//! Canonical manifest types and the per-service converter.
//!
//! Parsing compose YAML into a [`Project`] is an external collaborator's
//! job — this module only defines the canonical shape a parser must
//! produce and the pure conversion from one [`ServiceDef`] to the value
//! objects the remote executor needs.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::EngineError;
use crate::naming::{self, ComposeResourceKind};

#[derive(Debug, Clone, Default)]
pub struct Project {
  pub services: BTreeMap<String, ServiceDef>,
  pub networks: BTreeMap<String, NetworkDef>,
  pub volumes: BTreeMap<String, VolumeDef>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceDef {
  pub image: Option<String>,
  pub build: Option<BuildDef>,
  pub command: Option<Vec<String>>,
  pub entrypoint: Option<Vec<String>>,
  pub working_dir: Option<String>,
  pub environment: BTreeMap<String, Option<String>>,
  pub ports: Vec<PortSpec>,
  pub volumes: Vec<VolumeMount>,
  pub networks: Vec<NetworkAttachment>,
  pub depends_on: Vec<String>,
  pub restart: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildDef {
  pub context: String,
  pub dockerfile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortSpec {
  pub host_ip: Option<String>,
  pub host_port: Option<String>,
  pub container_port: String,
  pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
  /// Named volume (must match a key in `Project::volumes`) or host path.
  pub source: String,
  pub target: String,
  pub read_only: bool,
  pub is_bind: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkAttachment {
  pub logical_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkDef {
  pub explicit_name: Option<String>,
  pub driver: Option<String>,
  pub driver_opts: BTreeMap<String, String>,
  pub attachable: bool,
  pub internal: bool,
  pub enable_ipv6: bool,
  pub ipam_pools: Vec<IpamPool>,
}

#[derive(Debug, Clone)]
pub struct IpamPool {
  pub subnet: Option<String>,
  pub ip_range: Option<String>,
  pub gateway: Option<String>,
  pub aux_addresses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeDef {
  pub driver: Option<String>,
  pub driver_opts: BTreeMap<String, String>,
}

/// Validates the structural invariants required before conversion: every
/// service has `image` or `build`, no empty service name, at least one
/// service.
pub fn validate(project: &Project) -> Result<(), EngineError> {
  if project.services.is_empty() {
    return Err(EngineError::validation(anyhow::anyhow!(
      "manifest declares no services"
    )));
  }
  for (name, service) in &project.services {
    if name.trim().is_empty() {
      return Err(EngineError::validation(anyhow::anyhow!(
        "manifest contains an empty service name"
      )));
    }
    if service.image.is_none() && service.build.is_none() {
      return Err(EngineError::validation(anyhow::anyhow!(
        "service \"{name}\" declares neither image nor build"
      )));
    }
  }
  Ok(())
}

#[derive(Debug, Clone)]
pub struct ContainerCreateOptions {
  pub image: String,
  pub command: Option<Vec<String>>,
  pub entrypoint: Option<Vec<String>>,
  pub working_dir: Option<String>,
  pub env: Vec<String>,
  pub exposed_ports: Vec<String>,
  pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PortBinding {
  pub host_ip: Option<String>,
  pub host_port: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
  pub source: String,
  pub target: String,
  pub read_only: bool,
  pub is_bind: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HostOptions {
  pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
  pub mounts: Vec<MountSpec>,
  pub restart_policy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkAttachOptions {
  pub network_name: String,
  pub aliases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConvertedService {
  pub create: ContainerCreateOptions,
  pub host: HostOptions,
  pub attachments: Vec<NetworkAttachOptions>,
  /// `<ProjectName>-<serviceName>:latest`, used when `build` is declared.
  pub build_image_tag: String,
}

/// Converts one parsed service entry into the three value objects the
/// remote executor needs. Deterministic: the same `ServiceDef` always
/// produces the same `ContainerCreateOptions`/`HostOptions`/attachments.
pub fn convert_service(
  service_name: &str,
  service: &ServiceDef,
  project: &Project,
  service_id: &str,
  team_id: &str,
  server_id: &str,
) -> Result<ConvertedService, EngineError> {
  let image = service
    .image
    .clone()
    .unwrap_or_else(|| format!("{}-{service_name}:latest", naming::project_name(service_id)));

  let env: Vec<String> = service
    .environment
    .iter()
    .map(|(k, v)| format!("{k}={}", v.clone().unwrap_or_default()))
    .collect();

  let mut exposed_ports: BTreeSet<String> = BTreeSet::new();
  let mut port_bindings: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
  for port in &service.ports {
    let container_port = port.container_port.trim();
    if container_port.is_empty() || container_port.parse::<u32>().is_err() {
      return Err(EngineError::validation(anyhow::anyhow!(
        "service \"{service_name}\" has an invalid port spec: container port \"{container_port}\""
      )));
    }
    let key = format!("{container_port}/{}", port.protocol);
    exposed_ports.insert(key.clone());
    port_bindings.entry(key).or_default().push(PortBinding {
      host_ip: port.host_ip.clone(),
      host_port: port.host_port.clone(),
    });
  }
  let exposed_ports: Vec<String> = exposed_ports.into_iter().collect();

  let mounts = service
    .volumes
    .iter()
    .map(|mount| MountSpec {
      source: if mount.is_bind {
        mount.source.clone()
      } else {
        naming::volume_name(&mount.source, service_id)
      },
      target: mount.target.clone(),
      read_only: mount.read_only,
      is_bind: mount.is_bind,
    })
    .collect();

  let attachments = service
    .networks
    .iter()
    .map(|attachment| {
      let network_def = project.networks.get(&attachment.logical_name);
      let resolved = naming::resolve_network_name(
        &attachment.logical_name,
        network_def.and_then(|n| n.explicit_name.as_deref()),
        service_id,
      );
      NetworkAttachOptions {
        network_name: resolved,
        aliases: vec![service_name.to_string()],
      }
    })
    .collect();

  let labels = naming::labels(
    service_id,
    team_id,
    server_id,
    service_name,
    ComposeResourceKind::Service,
  );

  Ok(ConvertedService {
    create: ContainerCreateOptions {
      image,
      command: service.command.clone(),
      entrypoint: service.entrypoint.clone(),
      working_dir: service.working_dir.clone(),
      env,
      exposed_ports,
      labels,
    },
    host: HostOptions {
      port_bindings,
      mounts,
      restart_policy: service.restart.clone(),
    },
    attachments,
    build_image_tag: format!(
      "{}-{service_name}:latest",
      naming::project_name(service_id)
    ),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn minimal_service(image: &str) -> ServiceDef {
    ServiceDef { image: Some(image.to_string()), ..Default::default() }
  }

  #[test]
  fn validate_rejects_empty_project() {
    let project = Project::default();
    assert!(validate(&project).is_err());
  }

  #[test]
  fn validate_rejects_service_without_image_or_build() {
    let mut project = Project::default();
    project.services.insert("web".into(), ServiceDef::default());
    let err = validate(&project).unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::Validation);
  }

  #[test]
  fn convert_assigns_env_and_labels() {
    let mut project = Project::default();
    let mut service = minimal_service("nginx:latest");
    service.environment.insert("FOO".into(), Some("bar".into()));
    service.environment.insert("EMPTY".into(), None);
    project.services.insert("web".into(), service.clone());

    let converted =
      convert_service("web", &service, &project, "svc1", "team1", "server1")
        .unwrap();
    assert!(converted.create.env.contains(&"FOO=bar".to_string()));
    assert!(converted.create.env.contains(&"EMPTY=".to_string()));
    assert_eq!(
      converted.create.labels.get("starker.service.id").unwrap(),
      "svc1"
    );
  }

  #[test]
  fn convert_rejects_invalid_port() {
    let mut project = Project::default();
    let mut service = minimal_service("nginx:latest");
    service.ports.push(PortSpec {
      host_ip: None,
      host_port: Some("8080".into()),
      container_port: "not-a-port".into(),
      protocol: "tcp".into(),
    });
    project.services.insert("web".into(), service.clone());

    let err =
      convert_service("web", &service, &project, "svc1", "team1", "server1")
        .unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    assert!(format!("{:#}", err.source).contains("web"));
  }

  #[test]
  fn convert_resolves_network_name_same_as_naming_module() {
    let mut project = Project::default();
    project.networks.insert(
      "default".into(),
      NetworkDef { explicit_name: Some("shared".into()), ..Default::default() },
    );
    let mut service = minimal_service("nginx:latest");
    service.networks.push(NetworkAttachment { logical_name: "default".into() });
    project.services.insert("web".into(), service.clone());

    let converted =
      convert_service("web", &service, &project, "svc1", "team1", "server1")
        .unwrap();
    assert_eq!(converted.attachments[0].network_name, "shared");
    assert_eq!(converted.attachments[0].aliases, vec!["web".to_string()]);
  }

  #[test]
  fn convert_dedupes_exposed_ports_across_multiple_bindings() {
    let mut project = Project::default();
    let mut service = minimal_service("nginx:latest");
    service.ports.push(PortSpec {
      host_ip: None,
      host_port: Some("8080".into()),
      container_port: "80".into(),
      protocol: "tcp".into(),
    });
    service.ports.push(PortSpec {
      host_ip: Some("127.0.0.1".into()),
      host_port: Some("8081".into()),
      container_port: "80".into(),
      protocol: "tcp".into(),
    });
    project.services.insert("web".into(), service.clone());

    let converted =
      convert_service("web", &service, &project, "svc1", "team1", "server1").unwrap();
    assert_eq!(converted.create.exposed_ports, vec!["80/tcp".to_string()]);
    assert_eq!(converted.host.port_bindings.get("80/tcp").unwrap().len(), 2);
  }

  #[test]
  fn convert_is_deterministic() {
    let mut project = Project::default();
    let service = minimal_service("nginx:latest");
    project.services.insert("web".into(), service.clone());
    let a = convert_service("web", &service, &project, "svc1", "t", "s").unwrap();
    let b = convert_service("web", &service, &project, "svc1", "t", "s").unwrap();
    assert_eq!(a.create.image, b.create.image);
    assert_eq!(a.create.labels, b.create.labels);
  }
}
