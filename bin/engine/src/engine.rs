//! Orchestrates one `start`/`stop`/`restart` end-to-end and returns
//! immediately with an event stream handle, continuing in the background.

use std::fmt;
use std::sync::Arc;

use command::Log;
use futures::StreamExt;
use sqlx::{PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{ConnectionPool, ManifestParser, SshSession};
use crate::config::{EngineConfig, COMPOSE_FILENAME_SEARCH_ORDER};
use crate::db::{self, models::ContainerState};
use crate::dependency;
use crate::error::EngineError;
use crate::events::{self, EventHandle, EventStream};
use crate::manifest::{self, Project};
use crate::naming::{self, ComposeResourceKind};
use crate::reconcile;
use crate::remote::{DaemonClient, NetworkSpec, VolumeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Start,
  Stop,
  Restart,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Operation::Start => "start",
      Operation::Stop => "stop",
      Operation::Restart => "restart",
    };
    f.write_str(s)
  }
}

#[derive(Clone)]
pub struct Engine {
  pool: PgPool,
  connections: Arc<dyn ConnectionPool>,
  parser: Arc<dyn ManifestParser>,
  config: Arc<EngineConfig>,
}

impl Engine {
  pub fn new(
    pool: PgPool,
    connections: Arc<dyn ConnectionPool>,
    parser: Arc<dyn ManifestParser>,
    config: EngineConfig,
  ) -> Self {
    Engine { pool, connections, parser, config: Arc::new(config) }
  }

  /// `cancel` is the caller's context: cancelling it at any point collapses
  /// the run to the fatal path with a *cancelled* error. The in-flight step
  /// is allowed to finish; cancellation is only observed between steps.
  pub fn start(&self, service_id: impl Into<String>, cancel: CancellationToken) -> EventStream {
    self.spawn(service_id.into(), Operation::Start, cancel)
  }

  pub fn stop(&self, service_id: impl Into<String>, cancel: CancellationToken) -> EventStream {
    self.spawn(service_id.into(), Operation::Stop, cancel)
  }

  pub fn restart(&self, service_id: impl Into<String>, cancel: CancellationToken) -> EventStream {
    self.spawn(service_id.into(), Operation::Restart, cancel)
  }

  /// Non-mutating: runs the prelude (clone/fetch, parse, validate) without
  /// touching the daemon.
  pub fn refresh_compose_config(
    &self,
    service_id: impl Into<String>,
    cancel: CancellationToken,
  ) -> EventStream {
    let service_id = service_id.into();
    let (handle, stream) = events::channel();
    let this = self.clone();
    tokio::spawn(async move { this.run_refresh(service_id, cancel, handle).await });
    stream
  }

  /// Removes every DB-tracked volume's daemon-side volume after verifying
  /// ownership, then deletes the rows. Not part of start/stop/restart.
  pub fn purge_volumes(
    &self,
    service_id: impl Into<String>,
    cancel: CancellationToken,
  ) -> EventStream {
    let service_id = service_id.into();
    let (handle, stream) = events::channel();
    let this = self.clone();
    tokio::spawn(async move { this.run_purge(service_id, cancel, handle).await });
    stream
  }

  fn spawn(&self, service_id: String, op: Operation, cancel: CancellationToken) -> EventStream {
    let (handle, stream) = events::channel();
    let this = self.clone();
    tokio::spawn(async move { this.run(service_id, op, cancel, handle).await });
    stream
  }

  #[tracing::instrument(skip(self, cancel, events), fields(service_id = %service_id, operation = %op))]
  async fn run(&self, service_id: String, op: Operation, cancel: CancellationToken, events: EventHandle) {
    let result = self.run_fallible(&service_id, op, &cancel, &events).await;
    match result {
      Ok(()) => events.done(),
      Err(e) => {
        tracing::warn!(kind = %e.kind, "{:#}", e.source);
        events.fatal(format!("{:#}", e.source));
      }
    }
  }

  async fn run_fallible(
    &self,
    service_id: &str,
    op: Operation,
    cancel: &CancellationToken,
    events: &EventHandle,
  ) -> Result<(), EngineError> {
    let mut tx = self.pool.begin().await.map_err(EngineError::persistence)?;
    let prelude = self.run_prelude(&mut tx, service_id, op, cancel, events).await?;

    match op {
      Operation::Start => {
        self.run_start_phases(&mut tx, service_id, &prelude, cancel, events).await?;
      }
      Operation::Stop => {
        self.run_stop_phases(&mut tx, service_id, &prelude, cancel, events).await?;
      }
      Operation::Restart => {
        self.run_stop_phases(&mut tx, service_id, &prelude, cancel, events).await?;
        self.run_start_phases(&mut tx, service_id, &prelude, cancel, events).await?;
      }
    }

    check_cancelled(cancel)?;
    tx.commit().await.map_err(EngineError::persistence)?;
    Ok(())
  }

  async fn run_refresh(&self, service_id: String, cancel: CancellationToken, events: EventHandle) {
    let result: Result<(), EngineError> = async {
      let mut tx = self.pool.begin().await.map_err(EngineError::persistence)?;
      self.run_prelude(&mut tx, &service_id, Operation::Start, &cancel, &events).await?;
      // Read-only: drop the transaction without committing any writes the
      // git-refresh step may have staged (they're only meaningful paired
      // with a real deploy).
      tx.rollback().await.map_err(EngineError::persistence)?;
      Ok(())
    }
    .await;
    match result {
      Ok(()) => events.done(),
      Err(e) => events.fatal(format!("{:#}", e.source)),
    }
  }

  async fn run_purge(&self, service_id: String, cancel: CancellationToken, events: EventHandle) {
    let result = self.run_purge_fallible(&service_id, &cancel, &events).await;
    match result {
      Ok(()) => events.done(),
      Err(e) => events.fatal(format!("{:#}", e.source)),
    }
  }

  async fn run_purge_fallible(
    &self,
    service_id: &str,
    cancel: &CancellationToken,
    events: &EventHandle,
  ) -> Result<(), EngineError> {
    let mut tx = self.pool.begin().await.map_err(EngineError::persistence)?;
    let acquired =
      db::try_acquire_service_lock(&mut tx, &self.config.lock_namespace, service_id).await?;
    if !acquired {
      return Err(EngineError::conflict(anyhow::anyhow!(
        "service {service_id} has an operation already in flight"
      )));
    }
    let service = db::get_service(&mut tx, service_id)
      .await?
      .ok_or_else(|| EngineError::validation(anyhow::anyhow!("unknown service \"{service_id}\"")))?;
    let (daemon, _ssh) = self
      .connections
      .connect(&service.team_id, &service.server_id)
      .await
      .map_err(EngineError::remote)?;

    let volumes = db::list_volumes_by_service(&mut tx, service_id).await?;
    for volume in &volumes {
      check_cancelled(cancel)?;
      let resolved = naming::volume_name(&volume.logical_name, service_id);
      match daemon.find_volume_by_name(&resolved).await {
        Ok(Some(remote)) if naming::is_owned_by(&remote.labels, service_id) => {
          if let Err(e) = daemon.remove_volume(&resolved).await {
            events.err(format!("failed to remove volume \"{resolved}\": {e:#}"));
            continue;
          }
        }
        Ok(Some(_)) => {
          events.err(format!("volume \"{resolved}\" is not owned by this service, skipping"));
          continue;
        }
        Ok(None) => {}
        Err(e) => {
          events.err(format!("failed to inspect volume \"{resolved}\": {e:#}"));
          continue;
        }
      }
      db::delete_volume(&mut tx, &volume.id).await?;
      events.info(format!("purged volume \"{}\"", volume.logical_name));
    }

    tx.commit().await.map_err(EngineError::persistence)?;
    Ok(())
  }

  /// Shared prelude: acquire the per-service lock, load the service row and
  /// its git source and stored compose config, optionally refresh from git,
  /// parse and validate the manifest, then connect to the remote daemon.
  async fn run_prelude(
    &self,
    tx: &mut Transaction<'_, Postgres>,
    service_id: &str,
    op: Operation,
    cancel: &CancellationToken,
    events: &EventHandle,
  ) -> Result<Prelude, EngineError> {
    check_cancelled(cancel)?;
    let acquired =
      db::try_acquire_service_lock(tx, &self.config.lock_namespace, service_id).await?;
    if !acquired {
      return Err(EngineError::conflict(anyhow::anyhow!(
        "service {service_id} has an operation already in flight"
      )));
    }

    let service = db::get_service(tx, service_id)
      .await?
      .ok_or_else(|| EngineError::validation(anyhow::anyhow!("unknown service \"{service_id}\"")))?;
    let git_source = db::get_git_source(tx, service_id).await?;

    let mut compose_text = db::get_compose_config(tx, service_id)
      .await?
      .map(|c| c.contents)
      .unwrap_or_default();

    if matches!(op, Operation::Start | Operation::Restart) {
      if let Some(source) = &git_source {
        let (_daemon, ssh) = self
          .connections
          .connect(&service.team_id, &service.server_id)
          .await
          .map_err(EngineError::remote)?;
        events.step("refreshing source from git");
        match refresh_git_source(ssh.as_ref(), &self.config, service_id, source).await {
          Ok(text) => {
            db::update_compose_config(tx, service_id, &text).await?;
            compose_text = text;
            events.info("compose config refreshed from git");
          }
          Err(e) => {
            // Non-fatal: proceed with the previously stored manifest.
            events.err(format!("git refresh failed, using previous manifest: {e:#}"));
          }
        }
      }
    }

    let project = self.parser.parse(&compose_text).map_err(EngineError::validation)?;
    manifest::validate(&project)?;

    let (daemon, ssh) = self
      .connections
      .connect(&service.team_id, &service.server_id)
      .await
      .map_err(EngineError::remote)?;

    Ok(Prelude {
      project,
      daemon,
      ssh,
      team_id: service.team_id,
      server_id: service.server_id,
    })
  }

  /// start: reconcile -> pull/build images -> ensure networks -> ensure
  /// volumes -> start containers in dependency order.
  async fn run_start_phases(
    &self,
    tx: &mut Transaction<'_, Postgres>,
    service_id: &str,
    prelude: &Prelude,
    cancel: &CancellationToken,
    events: &EventHandle,
  ) -> Result<(), EngineError> {
    reconcile::reconcile(tx, service_id, &prelude.project).await?;

    let depends_on: std::collections::BTreeMap<String, Vec<String>> = prelude
      .project
      .services
      .iter()
      .map(|(name, def)| (name.clone(), def.depends_on.clone()))
      .collect();
    let order = dependency::resolve_start_order(&depends_on)?;

    let mut pulled = std::collections::BTreeSet::new();
    for name in &order {
      check_cancelled(cancel)?;
      let service_def = &prelude.project.services[name];
      ensure_image(prelude.daemon.as_ref(), prelude.ssh.as_ref(), &self.config, service_id, name, service_def, events, &mut pulled).await?;
    }

    for (logical_name, network_def) in &prelude.project.networks {
      check_cancelled(cancel)?;
      ensure_network(tx, prelude.daemon.as_ref(), service_id, &prelude.team_id, &prelude.server_id, logical_name, network_def, events).await?;
    }

    for logical_name in prelude.project.volumes.keys() {
      check_cancelled(cancel)?;
      ensure_volume(tx, prelude.daemon.as_ref(), service_id, &prelude.team_id, &prelude.server_id, logical_name, events).await?;
    }

    for name in &order {
      check_cancelled(cancel)?;
      let service_def = &prelude.project.services[name];
      start_one_container(tx, prelude.daemon.as_ref(), service_id, &prelude.team_id, &prelude.server_id, name, service_def, &prelude.project, events).await?;
    }

    Ok(())
  }

  /// stop: stop+remove containers in reverse dependency order -> teardown
  /// networks. Per-item errors are non-fatal.
  async fn run_stop_phases(
    &self,
    tx: &mut Transaction<'_, Postgres>,
    service_id: &str,
    prelude: &Prelude,
    cancel: &CancellationToken,
    events: &EventHandle,
  ) -> Result<(), EngineError> {
    let depends_on: std::collections::BTreeMap<String, Vec<String>> = prelude
      .project
      .services
      .iter()
      .map(|(name, def)| (name.clone(), def.depends_on.clone()))
      .collect();
    let order = dependency::resolve_start_order(&depends_on)?;
    let reverse = dependency::reverse_order(&order);

    for name in &reverse {
      // Deliberately not gated on `cancel`: a stop already in its
      // per-container loop is the rollback/teardown path itself, and should
      // run to completion rather than abandon containers half-stopped.
      stop_one_container(tx, prelude.daemon.as_ref(), service_id, &self.config, name, events).await;
    }

    teardown_networks(tx, prelude.daemon.as_ref(), service_id, events).await?;

    Ok(())
  }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), EngineError> {
  if cancel.is_cancelled() {
    Err(EngineError::cancelled(anyhow::anyhow!("operation was cancelled")))
  } else {
    Ok(())
  }
}

struct Prelude {
  project: Project,
  daemon: Arc<dyn DaemonClient>,
  ssh: Arc<dyn SshSession>,
  team_id: String,
  server_id: String,
}

/// Directory-existence probes and other small SSH commands are bounded by
/// `config.ssh_probe_timeout_secs`; `git clone`/`git pull` are not — they
/// have no intrinsic timeout, same as image pull.
async fn run_probe(
  ssh: &dyn SshSession,
  config: &EngineConfig,
  command: &str,
) -> anyhow::Result<Log> {
  tokio::time::timeout(
    std::time::Duration::from_secs(config.ssh_probe_timeout_secs),
    ssh.run(command),
  )
  .await
  .map_err(|_| anyhow::anyhow!("ssh probe timed out after {}s: {command}", config.ssh_probe_timeout_secs))?
}

async fn refresh_git_source(
  ssh: &dyn SshSession,
  config: &EngineConfig,
  service_id: &str,
  source: &db::models::ServiceSourceGit,
) -> anyhow::Result<String> {
  let checkout = config.checkout_path(service_id);
  let checkout_str = checkout.to_string_lossy().into_owned();

  run_probe(ssh, config, &format!("mkdir -p {}", shell_escape::escape(checkout_str.clone().into()))).await?;
  let probe = run_probe(
    ssh,
    config,
    &format!("test -d {}", shell_escape::escape(format!("{checkout_str}/.git").into())),
  )
  .await?;

  if probe.success {
    let log = ssh.run(&format!("cd {} && git pull", shell_escape::escape(checkout_str.clone().into()))).await?;
    if !log.success {
      anyhow::bail!("git pull failed: {}", log.stderr);
    }
  } else {
    let branch_arg = source
      .branch
      .as_deref()
      .map(|b| format!(" --branch {b}"))
      .unwrap_or_default();
    let log = ssh
      .run(&format!(
        "git clone --depth 1{branch_arg} {} {}",
        source.repo_url,
        shell_escape::escape(checkout_str.clone().into())
      ))
      .await?;
    if !log.success {
      anyhow::bail!("git clone failed: {}", log.stderr);
    }
  }

  let candidates: Vec<String> = match &source.compose_path {
    Some(path) if !path.is_empty() => vec![path.clone()],
    _ => COMPOSE_FILENAME_SEARCH_ORDER.iter().map(|s| s.to_string()).collect(),
  };
  for candidate in &candidates {
    let full = format!("{checkout_str}/{candidate}");
    let log = run_probe(ssh, config, &format!("cat {}", shell_escape::escape(full.into()))).await?;
    if log.success {
      return Ok(log.stdout);
    }
  }
  anyhow::bail!("no compose file found under {checkout_str} (searched: {candidates:?})")
}

async fn ensure_image(
  daemon: &dyn DaemonClient,
  ssh: &dyn SshSession,
  config: &EngineConfig,
  service_id: &str,
  service_name: &str,
  service_def: &manifest::ServiceDef,
  events: &EventHandle,
  pulled: &mut std::collections::BTreeSet<String>,
) -> Result<(), EngineError> {
  if let Some(image) = &service_def.image {
    if pulled.contains(image) {
      return Ok(());
    }
    let mut stream = daemon.pull_image(image).await.map_err(EngineError::remote)?;
    let mut failed = None;
    while let Some(message) = stream.next().await {
      match message {
        Ok(message) => {
          if message.is_error {
            failed = Some(message.status.clone());
          }
          events.progress(
            message.id.clone().unwrap_or_else(|| image.clone()),
            message.status,
            message.current,
            message.total,
          );
        }
        Err(e) => failed = Some(format!("{e:#}")),
      }
    }
    if let Some(reason) = failed {
      return Err(EngineError::remote(anyhow::anyhow!("pulling \"{image}\" failed: {reason}")));
    }
    events.info(format!("image \"{image}\" ready"));
    pulled.insert(image.clone());
    return Ok(());
  }

  let build = service_def.build.as_ref().expect("validated: image or build present");
  let tag = format!("{}-{service_name}:latest", naming::project_name(service_id));
  if daemon.image_exists(&tag).await.map_err(EngineError::remote)? {
    events.info(format!("build image \"{tag}\" already present, skipping build"));
    return Ok(());
  }

  let build_ctx = config.checkout_path(service_id).join(&build.context);
  let tar_cmd = format!(
    "tar -cf - -C {} .",
    shell_escape::escape(build_ctx.to_string_lossy().into_owned().into())
  );
  let tar_body = ssh.run_binary(&tar_cmd).await.map_err(EngineError::remote)?;

  let mut stream = daemon
    .build_image(&tag, build.dockerfile.as_deref(), tar_body)
    .await
    .map_err(EngineError::remote)?;
  let mut failed = None;
  while let Some(message) = stream.next().await {
    match message {
      Ok(message) => {
        if message.is_error {
          failed = Some(message.status.clone());
        }
        events.log(message.status);
      }
      Err(e) => failed = Some(format!("{e:#}")),
    }
  }
  if let Some(reason) = failed {
    return Err(EngineError::remote(anyhow::anyhow!("building \"{tag}\" failed: {reason}")));
  }
  events.info(format!("image \"{tag}\" built"));
  Ok(())
}

async fn ensure_network(
  tx: &mut Transaction<'_, Postgres>,
  daemon: &dyn DaemonClient,
  service_id: &str,
  team_id: &str,
  server_id: &str,
  logical_name: &str,
  network_def: &manifest::NetworkDef,
  events: &EventHandle,
) -> Result<(), EngineError> {
  let resolved = naming::resolve_network_name(logical_name, network_def.explicit_name.as_deref(), service_id);
  if let Some(existing) = daemon.find_network_by_name(&resolved).await.map_err(EngineError::remote)? {
    if !naming::is_owned_by(&existing.labels, service_id) {
      return Err(EngineError::conflict(anyhow::anyhow!(
        "network \"{resolved}\" exists on the daemon but is not owned by this service"
      )));
    }
    events.info(format!("network \"{resolved}\" already exists"));
    if let Some(row) = db::list_networks_by_service(tx, service_id)
      .await?
      .into_iter()
      .find(|n| n.logical_name == logical_name)
    {
      db::update_network_daemon_id(tx, &row.id, &existing.id).await?;
    }
    return Ok(());
  }

  let labels = naming::labels(service_id, team_id, server_id, logical_name, ComposeResourceKind::Network);
  let spec = NetworkSpec {
    driver: network_def.driver.clone(),
    driver_opts: network_def.driver_opts.clone(),
    attachable: network_def.attachable,
    internal: network_def.internal,
    enable_ipv6: network_def.enable_ipv6,
    ipam_pools: network_def.ipam_pools.clone(),
  };
  let daemon_id = daemon
    .create_network(&resolved, &spec, &labels)
    .await
    .map_err(EngineError::remote)?;
  if let Some(row) = db::list_networks_by_service(tx, service_id)
    .await?
    .into_iter()
    .find(|n| n.logical_name == logical_name)
  {
    db::update_network_daemon_id(tx, &row.id, &daemon_id).await?;
  }
  events.info(format!("created network \"{resolved}\""));
  Ok(())
}

async fn ensure_volume(
  tx: &mut Transaction<'_, Postgres>,
  daemon: &dyn DaemonClient,
  service_id: &str,
  team_id: &str,
  server_id: &str,
  logical_name: &str,
  events: &EventHandle,
) -> Result<(), EngineError> {
  let resolved = naming::volume_name(logical_name, service_id);
  if daemon.find_volume_by_name(&resolved).await.map_err(EngineError::remote)?.is_some() {
    events.info(format!("volume \"{resolved}\" already exists"));
    return Ok(());
  }
  let labels = naming::labels(service_id, team_id, server_id, logical_name, ComposeResourceKind::Volume);
  let daemon_id = daemon
    .create_volume(&resolved, &VolumeSpec::default(), &labels)
    .await
    .map_err(EngineError::remote)?;
  if let Some(row) = db::list_volumes_by_service(tx, service_id)
    .await?
    .into_iter()
    .find(|v| v.logical_name == logical_name)
  {
    db::update_volume_daemon_id(tx, &row.id, &daemon_id).await?;
  }
  events.info(format!("created volume \"{resolved}\""));
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start_one_container(
  tx: &mut Transaction<'_, Postgres>,
  daemon: &dyn DaemonClient,
  service_id: &str,
  team_id: &str,
  server_id: &str,
  service_name: &str,
  service_def: &manifest::ServiceDef,
  project: &Project,
  events: &EventHandle,
) -> Result<(), EngineError> {
  let name = naming::container_name(service_name, service_id);

  // Look up any existing container by exact name; a foreign owner blocks
  // the whole operation.
  let existing = daemon.find_container_by_name(&name).await.map_err(EngineError::remote)?;
  if let Some(remote) = &existing {
    if !naming::is_owned_by(&remote.labels, service_id) {
      return Err(EngineError::conflict(anyhow::anyhow!(
        "container \"{name}\" exists on the daemon but is not owned by this service"
      )));
    }
    if remote.running {
      // Reuse in place: it's already running and labelled as ours.
      events.info(format!("container \"{name}\" already running, reusing"));
      if let Some(row) = db::get_container_by_name(tx, service_id, service_name).await? {
        db::update_container(tx, &row.id, Some(&remote.id), ContainerState::Running).await?;
      }
      return Ok(());
    }
    daemon.remove_container(&remote.id, true).await.map_err(EngineError::remote)?;
  }

  let converted = manifest::convert_service(service_name, service_def, project, service_id, team_id, server_id)?;

  let daemon_id = match daemon
    .create_container(&name, &converted.create, &converted.host, &converted.attachments)
    .await
  {
    Ok(id) => id,
    Err(e) if is_name_conflict(&e) => {
      // A name-conflict retries exactly once after a forced existence
      // check + removal.
      if let Some(remote) = daemon.find_container_by_name(&name).await.map_err(EngineError::remote)? {
        daemon.remove_container(&remote.id, true).await.map_err(EngineError::remote)?;
      }
      daemon
        .create_container(&name, &converted.create, &converted.host, &converted.attachments)
        .await
        .map_err(|e| EngineError::remote(anyhow::anyhow!("create retry failed for \"{name}\": {e:#}")))?
    }
    Err(e) => return Err(EngineError::remote(e)),
  };

  daemon.start_container(&daemon_id).await.map_err(EngineError::remote)?;

  if let Some(row) = db::get_container_by_name(tx, service_id, service_name).await? {
    db::update_container(tx, &row.id, Some(&daemon_id), ContainerState::Running).await?;
  }
  events.step(format!("started \"{name}\""));
  Ok(())
}

async fn stop_one_container(
  tx: &mut Transaction<'_, Postgres>,
  daemon: &dyn DaemonClient,
  service_id: &str,
  config: &EngineConfig,
  service_name: &str,
  events: &EventHandle,
) {
  let row = match db::get_container_by_name(tx, service_id, service_name).await {
    Ok(Some(row)) => row,
    Ok(None) => return,
    Err(e) => {
      events.err(format!("lookup for \"{service_name}\" failed: {e}"));
      return;
    }
  };
  if row.state == ContainerState::Stopped || row.state == ContainerState::Removed {
    return;
  }
  let Some(daemon_id) = &row.daemon_id else { return };

  if let Err(e) = daemon.stop_container(daemon_id, config.container_stop_grace_secs as i64).await {
    events.err(format!("stop failed for \"{service_name}\": {e:#}"));
  }
  if let Err(e) = daemon.remove_container(daemon_id, true).await {
    events.err(format!("remove failed for \"{service_name}\": {e:#}"));
  }
  if let Err(e) = db::update_container(tx, &row.id, None, ContainerState::Stopped).await {
    events.err(format!("DB update failed for \"{service_name}\": {e}"));
  }
}

async fn teardown_networks(
  tx: &mut Transaction<'_, Postgres>,
  daemon: &dyn DaemonClient,
  service_id: &str,
  events: &EventHandle,
) -> Result<(), EngineError> {
  // ensure_network never stamps a daemon_id onto this row unless the
  // network was either created by us or already carried our ownership
  // labels, so removal here never needs its own label check.
  let networks = db::list_networks_by_service(tx, service_id).await?;
  for network in &networks {
    let Some(daemon_id) = &network.daemon_id else { continue };
    match daemon.network_connected_container_count(daemon_id).await {
      Ok(0) => {
        if let Err(e) = daemon.remove_network(daemon_id).await {
          events.err(format!("failed to remove network \"{}\": {e:#}", network.logical_name));
        }
      }
      Ok(_) => {
        events.info(format!("network \"{}\" still has connected containers, skipping", network.logical_name));
      }
      Err(e) => {
        events.err(format!("failed to inspect network \"{}\": {e:#}", network.logical_name));
      }
    }
  }
  db::delete_networks_for_service(tx, service_id).await?;
  Ok(())
}

/// True only for the daemon's "container name already in use" response;
/// any other daemon error (bad image, validation, network blip) must not
/// trigger the force-remove-and-retry cycle.
fn is_name_conflict(err: &anyhow::Error) -> bool {
  matches!(
    err.downcast_ref::<bollard::errors::Error>(),
    Some(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. })
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operation_display_matches_verb() {
    assert_eq!(Operation::Start.to_string(), "start");
    assert_eq!(Operation::Stop.to_string(), "stop");
    assert_eq!(Operation::Restart.to_string(), "restart");
  }

  #[test]
  fn is_name_conflict_only_matches_409() {
    let conflict = anyhow::Error::new(bollard::errors::Error::DockerResponseServerError {
      status_code: 409,
      message: "Conflict".into(),
    });
    assert!(is_name_conflict(&conflict));

    let not_found = anyhow::Error::new(bollard::errors::Error::DockerResponseServerError {
      status_code: 404,
      message: "Not Found".into(),
    });
    assert!(!is_name_conflict(&not_found));

    let other = anyhow::anyhow!("some unrelated failure");
    assert!(!is_name_conflict(&other));
  }

  struct SlowSsh;

  #[async_trait::async_trait]
  impl crate::collaborators::SshSession for SlowSsh {
    async fn run(&self, _command: &str) -> anyhow::Result<Log> {
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;
      Ok(Log {
        stage: "probe".into(),
        command: String::new(),
        stdout: String::new(),
        stderr: String::new(),
        success: true,
        start_ts: 0,
        end_ts: 0,
      })
    }

    async fn run_binary(&self, _command: &str) -> anyhow::Result<Vec<u8>> {
      Ok(Vec::new())
    }
  }

  #[tokio::test]
  async fn run_probe_times_out_on_slow_command() {
    let config = EngineConfig { ssh_probe_timeout_secs: 0, ..EngineConfig::default() };
    let result = run_probe(&SlowSsh, &config, "test -d /x").await;
    assert!(result.is_err());
  }
}
