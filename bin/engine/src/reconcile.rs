//! Reconciler: prepares the DB ledger so the remote executor can proceed
//! against a correct, declarative target shape. Never touches daemon state.

use sqlx::{Postgres, Transaction};

use crate::db::{self, models::ContainerState};
use crate::error::EngineError;
use crate::manifest::Project;

#[derive(Debug, Default)]
pub struct ReconcileReport {
  pub containers_inserted: Vec<String>,
  pub containers_marked_removed: Vec<String>,
  pub networks_inserted: Vec<String>,
  pub volumes_inserted: Vec<String>,
}

/// For every declared logical name not present in the DB, inserts a new
/// row (daemon-id null). For every DB container row whose logical name is
/// no longer declared, marks it `removed`. Networks/volumes absent from
/// the manifest are left alone here — they're deleted only during a full
/// teardown.
pub async fn reconcile(
  tx: &mut Transaction<'_, Postgres>,
  service_id: &str,
  project: &Project,
) -> Result<ReconcileReport, EngineError> {
  let mut report = ReconcileReport::default();

  let existing_containers = db::list_containers_by_service(tx, service_id).await?;
  for (name, _) in &project.services {
    if !existing_containers.iter().any(|c| &c.logical_name == name) {
      let id = format!("{service_id}:{name}");
      db::create_container(tx, &id, service_id, name).await?;
      report.containers_inserted.push(name.clone());
    }
  }
  for container in &existing_containers {
    if !project.services.contains_key(&container.logical_name)
      && container.state != ContainerState::Removed
    {
      db::mark_container_removed(tx, &container.id).await?;
      report.containers_marked_removed.push(container.logical_name.clone());
    }
  }

  let existing_networks = db::list_networks_by_service(tx, service_id).await?;
  for name in project.networks.keys() {
    if !existing_networks.iter().any(|n| &n.logical_name == name) {
      let id = format!("{service_id}:net:{name}");
      db::create_network(tx, &id, service_id, name).await?;
      report.networks_inserted.push(name.clone());
    }
  }

  let existing_volumes = db::list_volumes_by_service(tx, service_id).await?;
  for name in project.volumes.keys() {
    if !existing_volumes.iter().any(|v| &v.logical_name == name) {
      let id = format!("{service_id}:vol:{name}");
      db::create_volume(tx, &id, service_id, name).await?;
      report.volumes_inserted.push(name.clone());
    }
  }

  Ok(report)
}
