//! Typed CRUD over the service/container/network/volume tables. Every call
//! takes a caller-supplied transaction; no function here ever calls
//! `begin()`/`commit()` itself, so reconciliation and state transitions
//! compose atomically at the call site.

use chrono::Utc;
use sqlx::{Postgres, Row, Transaction};

use super::models::{
  ContainerState, Service, ServiceComposeConfig, ServiceContainer,
  ServiceNetwork, ServiceSourceGit, ServiceState, ServiceVolume,
};
use crate::error::EngineError;

type Tx<'a> = Transaction<'a, Postgres>;

fn persistence<T>(result: sqlx::Result<T>) -> Result<T, EngineError> {
  result.map_err(EngineError::persistence)
}

pub async fn get_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Option<Service>, EngineError> {
  let row = persistence(
    sqlx::query(
      "SELECT id, team_id, project_id, server_id, name, state, \
       last_deployed_at, created_at, updated_at \
       FROM service WHERE id = $1",
    )
    .bind(service_id)
    .fetch_optional(&mut **tx)
    .await,
  )?;
  let Some(row) = row else { return Ok(None) };
  let state: String = row.try_get("state").map_err(EngineError::persistence)?;
  Ok(Some(Service {
    id: row.try_get("id").map_err(EngineError::persistence)?,
    team_id: row.try_get("team_id").map_err(EngineError::persistence)?,
    project_id: row
      .try_get("project_id")
      .map_err(EngineError::persistence)?,
    server_id: row.try_get("server_id").map_err(EngineError::persistence)?,
    name: row.try_get("name").map_err(EngineError::persistence)?,
    state: state.parse().map_err(EngineError::persistence)?,
    last_deployed_at: row
      .try_get("last_deployed_at")
      .map_err(EngineError::persistence)?,
    created_at: row.try_get("created_at").map_err(EngineError::persistence)?,
    updated_at: row.try_get("updated_at").map_err(EngineError::persistence)?,
  }))
}

pub async fn update_service_state(
  tx: &mut Tx<'_>,
  service_id: &str,
  state: ServiceState,
  touch_last_deployed_at: bool,
) -> Result<(), EngineError> {
  let now = Utc::now();
  if touch_last_deployed_at {
    persistence(
      sqlx::query(
        "UPDATE service SET state = $1, last_deployed_at = $2, updated_at = $2 \
         WHERE id = $3",
      )
      .bind(state.to_string())
      .bind(now)
      .bind(service_id)
      .execute(&mut **tx)
      .await,
    )?;
  } else {
    persistence(
      sqlx::query(
        "UPDATE service SET state = $1, updated_at = $2 WHERE id = $3",
      )
      .bind(state.to_string())
      .bind(now)
      .bind(service_id)
      .execute(&mut **tx)
      .await,
    )?;
  }
  Ok(())
}

pub async fn get_compose_config(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Option<ServiceComposeConfig>, EngineError> {
  let row = persistence(
    sqlx::query(
      "SELECT service_id, contents, updated_at FROM service_compose_config \
       WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_optional(&mut **tx)
    .await,
  )?;
  Ok(row.map(|row| ServiceComposeConfig {
    service_id: row.get("service_id"),
    contents: row.get("contents"),
    updated_at: row.get("updated_at"),
  }))
}

pub async fn update_compose_config(
  tx: &mut Tx<'_>,
  service_id: &str,
  contents: &str,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query(
      "INSERT INTO service_compose_config (service_id, contents, updated_at) \
       VALUES ($1, $2, $3) \
       ON CONFLICT (service_id) DO UPDATE SET contents = EXCLUDED.contents, \
       updated_at = EXCLUDED.updated_at",
    )
    .bind(service_id)
    .bind(contents)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await,
  )?;
  Ok(())
}

pub async fn get_git_source(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Option<ServiceSourceGit>, EngineError> {
  let row = persistence(
    sqlx::query(
      "SELECT service_id, repo_url, branch, compose_path, webhook_secret \
       FROM service_source_git WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_optional(&mut **tx)
    .await,
  )?;
  Ok(row.map(|row| ServiceSourceGit {
    service_id: row.get("service_id"),
    repo_url: row.get("repo_url"),
    branch: row.get("branch"),
    compose_path: row.get("compose_path"),
    webhook_secret: row.get("webhook_secret"),
  }))
}

fn row_to_container(
  row: sqlx::postgres::PgRow,
) -> Result<ServiceContainer, EngineError> {
  let state: String = row.try_get("state").map_err(EngineError::persistence)?;
  Ok(ServiceContainer {
    id: row.try_get("id").map_err(EngineError::persistence)?,
    service_id: row.try_get("service_id").map_err(EngineError::persistence)?,
    logical_name: row
      .try_get("logical_name")
      .map_err(EngineError::persistence)?,
    daemon_id: row.try_get("daemon_id").map_err(EngineError::persistence)?,
    state: state.parse().map_err(EngineError::persistence)?,
    created_at: row.try_get("created_at").map_err(EngineError::persistence)?,
    updated_at: row.try_get("updated_at").map_err(EngineError::persistence)?,
  })
}

pub async fn list_containers_by_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Vec<ServiceContainer>, EngineError> {
  let rows = persistence(
    sqlx::query(
      "SELECT id, service_id, logical_name, daemon_id, state, created_at, \
       updated_at FROM service_container WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_all(&mut **tx)
    .await,
  )?;
  let mut out = Vec::with_capacity(rows.len());
  for row in rows {
    out.push(row_to_container(row)?);
  }
  Ok(out)
}

pub async fn get_container_by_name(
  tx: &mut Tx<'_>,
  service_id: &str,
  logical_name: &str,
) -> Result<Option<ServiceContainer>, EngineError> {
  let row = persistence(
    sqlx::query(
      "SELECT id, service_id, logical_name, daemon_id, state, created_at, \
       updated_at FROM service_container \
       WHERE service_id = $1 AND logical_name = $2",
    )
    .bind(service_id)
    .bind(logical_name)
    .fetch_optional(&mut **tx)
    .await,
  )?;
  match row {
    Some(row) => Ok(Some(row_to_container(row)?)),
    None => Ok(None),
  }
}

pub async fn create_container(
  tx: &mut Tx<'_>,
  id: &str,
  service_id: &str,
  logical_name: &str,
) -> Result<ServiceContainer, EngineError> {
  let now = Utc::now();
  persistence(
    sqlx::query(
      "INSERT INTO service_container \
       (id, service_id, logical_name, daemon_id, state, created_at, updated_at) \
       VALUES ($1, $2, $3, NULL, $4, $5, $5)",
    )
    .bind(id)
    .bind(service_id)
    .bind(logical_name)
    .bind(ContainerState::Stopped.to_string())
    .bind(now)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(ServiceContainer {
    id: id.to_string(),
    service_id: service_id.to_string(),
    logical_name: logical_name.to_string(),
    daemon_id: None,
    state: ContainerState::Stopped,
    created_at: now,
    updated_at: now,
  })
}

pub async fn update_container(
  tx: &mut Tx<'_>,
  id: &str,
  daemon_id: Option<&str>,
  state: ContainerState,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query(
      "UPDATE service_container SET daemon_id = $1, state = $2, updated_at = $3 \
       WHERE id = $4",
    )
    .bind(daemon_id)
    .bind(state.to_string())
    .bind(Utc::now())
    .bind(id)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(())
}

pub async fn mark_container_removed(
  tx: &mut Tx<'_>,
  id: &str,
) -> Result<(), EngineError> {
  update_container(tx, id, None, ContainerState::Removed).await
}

pub async fn list_networks_by_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Vec<ServiceNetwork>, EngineError> {
  let rows = persistence(
    sqlx::query(
      "SELECT id, service_id, logical_name, daemon_id, created_at, updated_at \
       FROM service_network WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_all(&mut **tx)
    .await,
  )?;
  Ok(
    rows
      .into_iter()
      .map(|row| ServiceNetwork {
        id: row.get("id"),
        service_id: row.get("service_id"),
        logical_name: row.get("logical_name"),
        daemon_id: row.get("daemon_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
      })
      .collect(),
  )
}

pub async fn create_network(
  tx: &mut Tx<'_>,
  id: &str,
  service_id: &str,
  logical_name: &str,
) -> Result<ServiceNetwork, EngineError> {
  let now = Utc::now();
  persistence(
    sqlx::query(
      "INSERT INTO service_network \
       (id, service_id, logical_name, daemon_id, created_at, updated_at) \
       VALUES ($1, $2, $3, NULL, $4, $4)",
    )
    .bind(id)
    .bind(service_id)
    .bind(logical_name)
    .bind(now)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(ServiceNetwork {
    id: id.to_string(),
    service_id: service_id.to_string(),
    logical_name: logical_name.to_string(),
    daemon_id: None,
    created_at: now,
    updated_at: now,
  })
}

pub async fn update_network_daemon_id(
  tx: &mut Tx<'_>,
  id: &str,
  daemon_id: &str,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query(
      "UPDATE service_network SET daemon_id = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(daemon_id)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(())
}

pub async fn delete_networks_for_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query("DELETE FROM service_network WHERE service_id = $1")
      .bind(service_id)
      .execute(&mut **tx)
      .await,
  )?;
  Ok(())
}

pub async fn list_volumes_by_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<Vec<ServiceVolume>, EngineError> {
  let rows = persistence(
    sqlx::query(
      "SELECT id, service_id, logical_name, daemon_id, created_at, updated_at \
       FROM service_volume WHERE service_id = $1",
    )
    .bind(service_id)
    .fetch_all(&mut **tx)
    .await,
  )?;
  Ok(
    rows
      .into_iter()
      .map(|row| ServiceVolume {
        id: row.get("id"),
        service_id: row.get("service_id"),
        logical_name: row.get("logical_name"),
        daemon_id: row.get("daemon_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
      })
      .collect(),
  )
}

pub async fn create_volume(
  tx: &mut Tx<'_>,
  id: &str,
  service_id: &str,
  logical_name: &str,
) -> Result<ServiceVolume, EngineError> {
  let now = Utc::now();
  persistence(
    sqlx::query(
      "INSERT INTO service_volume \
       (id, service_id, logical_name, daemon_id, created_at, updated_at) \
       VALUES ($1, $2, $3, NULL, $4, $4)",
    )
    .bind(id)
    .bind(service_id)
    .bind(logical_name)
    .bind(now)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(ServiceVolume {
    id: id.to_string(),
    service_id: service_id.to_string(),
    logical_name: logical_name.to_string(),
    daemon_id: None,
    created_at: now,
    updated_at: now,
  })
}

pub async fn update_volume_daemon_id(
  tx: &mut Tx<'_>,
  id: &str,
  daemon_id: &str,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query(
      "UPDATE service_volume SET daemon_id = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(daemon_id)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut **tx)
    .await,
  )?;
  Ok(())
}

pub async fn delete_volume(
  tx: &mut Tx<'_>,
  id: &str,
) -> Result<(), EngineError> {
  persistence(
    sqlx::query("DELETE FROM service_volume WHERE id = $1")
      .bind(id)
      .execute(&mut **tx)
      .await,
  )?;
  Ok(())
}

/// Cascade delete: compose-config, git-source, and every container/network/
/// volume row for the service.
pub async fn delete_all_for_service(
  tx: &mut Tx<'_>,
  service_id: &str,
) -> Result<(), EngineError> {
  for table in [
    "service_container",
    "service_network",
    "service_volume",
    "service_source_git",
    "service_compose_config",
  ] {
    persistence(
      sqlx::query(&format!("DELETE FROM {table} WHERE service_id = $1"))
        .bind(service_id)
        .execute(&mut **tx)
        .await,
    )?;
  }
  Ok(())
}

/// FNV-1a 64-bit, folded into the signed range Postgres advisory-lock
/// functions expect.
fn lock_key(namespace: &str, service_id: &str) -> i64 {
  let mut hash: u64 = 0xcbf29ce484222325;
  for byte in namespace.bytes().chain(std::iter::once(b':')).chain(service_id.bytes()) {
    hash ^= byte as u64;
    hash = hash.wrapping_mul(0x100000001b3);
  }
  hash as i64
}

/// Acquires the per-service advisory lock for the lifetime of `tx`
/// (released automatically on commit or rollback). Returns `false` without
/// blocking if another operation already holds it — the caller must map
/// that to a `conflict` error and fail fast.
pub async fn try_acquire_service_lock(
  tx: &mut Tx<'_>,
  namespace: &str,
  service_id: &str,
) -> Result<bool, EngineError> {
  let key = lock_key(namespace, service_id);
  let row = persistence(
    sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS acquired")
      .bind(key)
      .fetch_one(&mut **tx)
      .await,
  )?;
  Ok(row.get::<bool, _>("acquired"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lock_key_is_stable_and_scoped_by_namespace() {
    let a = lock_key("starker", "svc1");
    let b = lock_key("starker", "svc1");
    let c = lock_key("other-namespace", "svc1");
    assert_eq!(a, b);
    assert_ne!(a, c);
  }
}
