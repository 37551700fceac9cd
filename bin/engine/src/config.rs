use std::sync::OnceLock;

use anyhow::Context;
use logger::LogConfig;
use serde::Deserialize;

/// Filenames checked, in order, under a cloned service's tree when no
/// explicit compose path is configured on the git source.
pub const COMPOSE_FILENAME_SEARCH_ORDER: &[&str] = &[
  "docker-compose.yml",
  "docker-compose.yaml",
  "compose.yml",
  "compose.yaml",
  "Docker-Compose.yml",
  "docker-compose.prod.yml",
  "docker-compose.production.yml",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Postgres connection string for the state store.
  pub database_url: String,
  /// Prefix namespace for the per-service advisory lock; lets several
  /// engine deployments share one database without colliding locks.
  pub lock_namespace: String,
  /// Directory template root; the service id is appended as a path segment.
  pub checkout_root: String,
  /// Grace period given to `docker stop` before a force-remove.
  pub container_stop_grace_secs: u64,
  /// Timeout for directory-existence probes and other small SSH commands.
  pub ssh_probe_timeout_secs: u64,
  #[serde(flatten)]
  pub log: LogConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      database_url: "postgres://localhost/starker".into(),
      lock_namespace: "starker".into(),
      checkout_root: "/data/starker/services".into(),
      container_stop_grace_secs: 30,
      ssh_probe_timeout_secs: 10,
      log: LogConfig::default(),
    }
  }
}

impl EngineConfig {
  pub fn checkout_path(&self, service_id: &str) -> std::path::PathBuf {
    std::path::Path::new(&self.checkout_root).join(service_id)
  }
}

/// Loads configuration once per process from the environment (and a local
/// `.env` file if present).
pub fn engine_config() -> &'static EngineConfig {
  static CONFIG: OnceLock<EngineConfig> = OnceLock::new();
  CONFIG.get_or_init(|| {
    dotenvy::dotenv().ok();
    envy::from_env::<EngineConfig>()
      .context("failed to parse engine configuration from environment")
      .unwrap()
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checkout_path_joins_service_id() {
    let config = EngineConfig::default();
    let path = config.checkout_path("svc-123");
    assert_eq!(path, std::path::PathBuf::from("/data/starker/services/svc-123"));
  }

  #[test]
  fn search_order_starts_with_canonical_compose_filename() {
    assert_eq!(COMPOSE_FILENAME_SEARCH_ORDER[0], "docker-compose.yml");
    assert_eq!(COMPOSE_FILENAME_SEARCH_ORDER.len(), 7);
  }
}
