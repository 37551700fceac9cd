//! Remote Executor: stateless apart from the daemon client it is handed.
//! The trait boundary here is what lets the operation engine run against a
//! fake in tests.

pub mod docker;
pub mod logs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::manifest::{ContainerCreateOptions, HostOptions, NetworkAttachOptions};
use logs::LogLine;

#[derive(Debug, Clone)]
pub struct NetworkSpec {
  pub driver: Option<String>,
  pub driver_opts: BTreeMap<String, String>,
  pub attachable: bool,
  pub internal: bool,
  pub enable_ipv6: bool,
  pub ipam_pools: Vec<crate::manifest::IpamPool>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
  pub driver: Option<String>,
  pub driver_opts: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RemoteContainer {
  pub id: String,
  pub labels: BTreeMap<String, String>,
  pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LogTailOptions {
  pub follow: bool,
  pub tail: Option<String>,
  pub timestamps: bool,
  pub since: Option<i64>,
}

/// A single newline-delimited progress message from an image pull/build.
#[derive(Debug, Clone)]
pub struct ProgressMessage {
  pub id: Option<String>,
  pub status: String,
  pub current: Option<u64>,
  pub total: Option<u64>,
  pub is_error: bool,
}

#[async_trait]
pub trait DaemonClient: Send + Sync {
  /// Pulls `image`, yielding every progress message in arrival order.
  async fn pull_image(
    &self,
    image: &str,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProgressMessage>>>;

  async fn image_exists(&self, tag: &str) -> anyhow::Result<bool>;

  /// Streams `tar_body` (a tarred build context, already fetched over SSH)
  /// into the daemon's build endpoint, tagging the result `tag`.
  async fn build_image(
    &self,
    tag: &str,
    dockerfile: Option<&str>,
    tar_body: Vec<u8>,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProgressMessage>>>;

  async fn find_network_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>>;

  async fn create_network(
    &self,
    name: &str,
    spec: &NetworkSpec,
    labels: &BTreeMap<String, String>,
  ) -> anyhow::Result<String>;

  /// Number of containers still connected, used to decide whether teardown
  /// may remove the network.
  async fn network_connected_container_count(
    &self,
    daemon_id: &str,
  ) -> anyhow::Result<usize>;

  async fn remove_network(&self, daemon_id: &str) -> anyhow::Result<()>;

  async fn find_volume_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>>;

  async fn create_volume(
    &self,
    name: &str,
    spec: &VolumeSpec,
    labels: &BTreeMap<String, String>,
  ) -> anyhow::Result<String>;

  async fn remove_volume(&self, name: &str) -> anyhow::Result<()>;

  async fn find_container_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>>;

  async fn create_container(
    &self,
    name: &str,
    create: &ContainerCreateOptions,
    host: &HostOptions,
    attachments: &[NetworkAttachOptions],
  ) -> anyhow::Result<String>;

  async fn start_container(&self, daemon_id: &str) -> anyhow::Result<()>;

  async fn stop_container(
    &self,
    daemon_id: &str,
    grace_secs: i64,
  ) -> anyhow::Result<()>;

  async fn remove_container(
    &self,
    daemon_id: &str,
    force: bool,
  ) -> anyhow::Result<()>;

  async fn tail_logs(
    &self,
    daemon_id: &str,
    options: &LogTailOptions,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<LogLine>>>;
}
