//! Deterministic names and label-sets for every Docker resource the engine
//! creates: projects, containers, networks, volumes.
//!
//! `ResolveNetworkName` MUST be used identically by network creation and by
//! per-container network attachment, or a container attaches to a network
//! the engine never created.

use std::collections::BTreeMap;

const MAX_PROJECT_NAME_LEN: usize = 50;

pub const LABEL_SERVICE_ID: &str = "starker.service.id";
pub const LABEL_TEAM_ID: &str = "starker.team.id";
pub const LABEL_SERVER_ID: &str = "starker.server.id";
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_COMPOSE_NETWORK: &str = "com.docker.compose.network";
pub const LABEL_COMPOSE_VOLUME: &str = "com.docker.compose.volume";

/// Lowercases, maps any character outside `[a-z0-9_-]` to `-`, prepends `s`
/// if the result doesn't start alphanumeric, truncates to `max_len`.
fn sanitize(input: &str, max_len: usize) -> String {
  let mut out: String = input
    .to_lowercase()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
    .collect();
  let starts_alphanumeric =
    out.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
  if !starts_alphanumeric {
    out.insert(0, 's');
  }
  out.truncate(max_len);
  out
}

pub fn project_name(service_id: &str) -> String {
  format!("starker-{}", sanitize(service_id, MAX_PROJECT_NAME_LEN))
}

pub fn container_name(logical_service_name: &str, service_id: &str) -> String {
  format!("{logical_service_name}-{service_id}")
}

pub fn network_name(logical_network_name: &str, service_id: &str) -> String {
  format!("{logical_network_name}-{service_id}")
}

pub fn volume_name(logical_volume_name: &str, service_id: &str) -> String {
  format!("{logical_volume_name}-{service_id}")
}

/// Returns the manifest's explicit network name when set, else the derived
/// `NetworkName`. Callers on both the create side and the attach side must
/// go through this single function.
pub fn resolve_network_name(
  logical_network_name: &str,
  manifest_explicit_name: Option<&str>,
  service_id: &str,
) -> String {
  match manifest_explicit_name {
    Some(explicit) if !explicit.is_empty() => explicit.to_string(),
    _ => network_name(logical_network_name, service_id),
  }
}

pub fn connection_id(team_id: &str, server_id: &str) -> String {
  format!("{team_id}-{server_id}")
}

#[derive(Debug, Clone, Copy)]
pub enum ComposeResourceKind {
  Service,
  Network,
  Volume,
}

/// Builds the full label set applied to every resource the engine creates.
/// `logical_name` is the manifest-declared name of the
/// service/network/volume this resource is for.
pub fn labels(
  service_id: &str,
  team_id: &str,
  server_id: &str,
  logical_name: &str,
  kind: ComposeResourceKind,
) -> BTreeMap<String, String> {
  let mut labels = BTreeMap::new();
  labels.insert(LABEL_SERVICE_ID.to_string(), service_id.to_string());
  labels.insert(LABEL_TEAM_ID.to_string(), team_id.to_string());
  labels.insert(LABEL_SERVER_ID.to_string(), server_id.to_string());
  labels.insert(
    LABEL_COMPOSE_PROJECT.to_string(),
    project_name(service_id),
  );
  let compose_kind_label = match kind {
    ComposeResourceKind::Service => LABEL_COMPOSE_SERVICE,
    ComposeResourceKind::Network => LABEL_COMPOSE_NETWORK,
    ComposeResourceKind::Volume => LABEL_COMPOSE_VOLUME,
  };
  labels.insert(compose_kind_label.to_string(), logical_name.to_string());
  labels
}

/// Ownership check read by every destructive remote-executor operation:
/// only `starker.service.id` matters.
pub fn is_owned_by(
  resource_labels: &BTreeMap<String, String>,
  service_id: &str,
) -> bool {
  resource_labels
    .get(LABEL_SERVICE_ID)
    .is_some_and(|v| v == service_id)
}
