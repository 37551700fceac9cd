//! Bollard-backed [`DaemonClient`]: talks to the container daemon directly
//! over the SSH-tunnelled HTTP connection the pool hands out, rather than
//! shelling out to a CLI.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
  Config, CreateContainerOptions, ListContainersOptions,
  LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{
  HostConfig, Ipam, IpamConfig, Mount, MountTypeEnum, PortBinding as BollardPortBinding,
  PortMap,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use super::logs::{FrameDecoder, LogLine};
use super::{
  DaemonClient, LogTailOptions, NetworkSpec, ProgressMessage, RemoteContainer,
  VolumeSpec,
};
use crate::manifest::{ContainerCreateOptions, HostOptions, NetworkAttachOptions};

pub struct BollardDaemonClient {
  docker: Docker,
}

impl BollardDaemonClient {
  /// Connects over the already-established SSH tunnel's local HTTP
  /// endpoint; the connection pool is responsible for the tunnel itself
  /// and hands this client the socket to connect to.
  pub fn connect_to(docker_host: &str) -> anyhow::Result<Self> {
    let docker = Docker::connect_with_http(
      docker_host,
      120,
      bollard::API_DEFAULT_VERSION,
    )?;
    Ok(BollardDaemonClient { docker })
  }
}

fn classify_progress(status: Option<String>, error: Option<String>, id: Option<String>, current: Option<i64>, total: Option<i64>) -> ProgressMessage {
  let is_error = error.is_some()
    || status
      .as_deref()
      .is_some_and(|s| s.to_lowercase().contains("error"));
  ProgressMessage {
    id,
    status: error.or(status).unwrap_or_default(),
    current: current.map(|v| v.max(0) as u64),
    total: total.map(|v| v.max(0) as u64),
    is_error,
  }
}

#[async_trait]
impl DaemonClient for BollardDaemonClient {
  async fn pull_image(
    &self,
    image: &str,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProgressMessage>>> {
    let (name, tag) = image
      .rsplit_once(':')
      .map(|(n, t)| (n.to_string(), t.to_string()))
      .unwrap_or_else(|| (image.to_string(), "latest".to_string()));
    let stream = self
      .docker
      .create_image(
        Some(CreateImageOptions { from_image: name, tag, ..Default::default() }),
        None,
        None,
      )
      .map(|item| {
        item.map(|info| {
          classify_progress(
            info.status,
            info.error,
            info.id,
            info.progress_detail.as_ref().and_then(|d| d.current),
            info.progress_detail.as_ref().and_then(|d| d.total),
          )
        })
        .map_err(anyhow::Error::from)
      });
    Ok(Box::pin(stream))
  }

  async fn image_exists(&self, tag: &str) -> anyhow::Result<bool> {
    match self.docker.inspect_image(tag).await {
      Ok(_) => Ok(true),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  async fn build_image(
    &self,
    tag: &str,
    dockerfile: Option<&str>,
    tar_body: Vec<u8>,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<ProgressMessage>>> {
    let options = BuildImageOptions {
      dockerfile: dockerfile.unwrap_or("Dockerfile").to_string(),
      t: tag.to_string(),
      rm: true,
      ..Default::default()
    };
    let stream = self
      .docker
      .build_image(options, None, Some(tar_body.into()))
      .map(|item| {
        item
          .map(|info| {
            ProgressMessage {
              id: None,
              status: info.error.clone().or(info.stream.clone()).unwrap_or_default(),
              current: None,
              total: None,
              is_error: info.error.is_some(),
            }
          })
          .map_err(anyhow::Error::from)
      });
    Ok(Box::pin(stream))
  }

  async fn find_network_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>> {
    match self.docker.inspect_network(name, None::<InspectNetworkOptions<String>>).await {
      Ok(network) => Ok(Some(RemoteContainer {
        id: network.id.unwrap_or_default(),
        labels: network.labels.unwrap_or_default().into_iter().collect(),
        running: true,
      })),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn create_network(
    &self,
    name: &str,
    spec: &NetworkSpec,
    labels: &BTreeMap<String, String>,
  ) -> anyhow::Result<String> {
    let ipam_config: Vec<IpamConfig> = spec
      .ipam_pools
      .iter()
      .map(|pool| IpamConfig {
        subnet: pool.subnet.clone(),
        ip_range: pool.ip_range.clone(),
        gateway: pool.gateway.clone(),
        auxiliary_addresses: Some(pool.aux_addresses.clone().into_iter().collect()),
      })
      .collect();
    let response = self
      .docker
      .create_network(CreateNetworkOptions {
        name: name.to_string(),
        driver: spec.driver.clone().unwrap_or_else(|| "bridge".to_string()),
        internal: spec.internal,
        attachable: spec.attachable,
        enable_ipv6: spec.enable_ipv6,
        ipam: Ipam { driver: Some("default".to_string()), config: Some(ipam_config), options: None },
        options: spec.driver_opts.clone().into_iter().collect(),
        labels: labels.clone().into_iter().collect(),
        ..Default::default()
      })
      .await?;
    response.id.ok_or_else(|| anyhow::anyhow!("daemon did not return a network id for \"{name}\""))
  }

  async fn network_connected_container_count(
    &self,
    daemon_id: &str,
  ) -> anyhow::Result<usize> {
    let network = self
      .docker
      .inspect_network(daemon_id, Some(InspectNetworkOptions { verbose: true, scope: "" }))
      .await?;
    Ok(network.containers.map(|c| c.len()).unwrap_or(0))
  }

  async fn remove_network(&self, daemon_id: &str) -> anyhow::Result<()> {
    self.docker.remove_network(daemon_id).await?;
    Ok(())
  }

  async fn find_volume_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>> {
    match self.docker.inspect_volume(name).await {
      Ok(volume) => Ok(Some(RemoteContainer {
        id: volume.name,
        labels: volume.labels.into_iter().collect(),
        running: true,
      })),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn create_volume(
    &self,
    name: &str,
    spec: &VolumeSpec,
    labels: &BTreeMap<String, String>,
  ) -> anyhow::Result<String> {
    let volume = self
      .docker
      .create_volume(CreateVolumeOptions {
        name: name.to_string(),
        driver: spec.driver.clone().unwrap_or_else(|| "local".to_string()),
        driver_opts: spec.driver_opts.clone().into_iter().collect(),
        labels: labels.clone().into_iter().collect(),
      })
      .await?;
    Ok(volume.name)
  }

  async fn remove_volume(&self, name: &str) -> anyhow::Result<()> {
    self.docker.remove_volume(name, None).await?;
    Ok(())
  }

  async fn find_container_by_name(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<RemoteContainer>> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
      .await?;
    // The daemon returns prefix matches; filter to the exact name.
    let exact = containers.into_iter().find(|c| {
      c.names
        .as_ref()
        .is_some_and(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
    });
    Ok(exact.map(|c| RemoteContainer {
      id: c.id.unwrap_or_default(),
      labels: c.labels.unwrap_or_default().into_iter().collect(),
      running: c.state.as_deref() == Some("running"),
    }))
  }

  async fn create_container(
    &self,
    name: &str,
    create: &ContainerCreateOptions,
    host: &HostOptions,
    attachments: &[NetworkAttachOptions],
  ) -> anyhow::Result<String> {
    let mut port_bindings: PortMap = HashMap::new();
    for (container_port, bindings) in &host.port_bindings {
      port_bindings.insert(
        container_port.clone(),
        Some(
          bindings
            .iter()
            .map(|b| BollardPortBinding { host_ip: b.host_ip.clone(), host_port: b.host_port.clone() })
            .collect(),
        ),
      );
    }

    let mounts: Vec<Mount> = host
      .mounts
      .iter()
      .map(|m| Mount {
        target: Some(m.target.clone()),
        source: Some(m.source.clone()),
        typ: Some(if m.is_bind { MountTypeEnum::BIND } else { MountTypeEnum::VOLUME }),
        read_only: Some(m.read_only),
        ..Default::default()
      })
      .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> =
      create.exposed_ports.iter().map(|p| (p.clone(), HashMap::new())).collect();

    let config = Config {
      image: Some(create.image.clone()),
      cmd: create.command.clone(),
      entrypoint: create.entrypoint.clone(),
      working_dir: create.working_dir.clone(),
      env: Some(create.env.clone()),
      exposed_ports: Some(exposed_ports),
      labels: Some(create.labels.clone().into_iter().collect()),
      host_config: Some(HostConfig {
        port_bindings: Some(port_bindings),
        mounts: Some(mounts),
        restart_policy: host.restart_policy.as_ref().map(|policy| {
          bollard::models::RestartPolicy {
            name: restart_policy_name(policy),
            maximum_retry_count: None,
          }
        }),
        ..Default::default()
      }),
      networking_config: if attachments.is_empty() {
        None
      } else {
        Some(bollard::container::NetworkingConfig {
          endpoints_config: attachments
            .iter()
            .map(|a| {
              (
                a.network_name.clone(),
                bollard::models::EndpointSettings { aliases: Some(a.aliases.clone()), ..Default::default() },
              )
            })
            .collect(),
        })
      },
      ..Default::default()
    };

    let response = self
      .docker
      .create_container(Some(CreateContainerOptions { name: name.to_string(), platform: None }), config)
      .await?;
    Ok(response.id)
  }

  async fn start_container(&self, daemon_id: &str) -> anyhow::Result<()> {
    self.docker.start_container::<String>(daemon_id, None).await?;
    Ok(())
  }

  async fn stop_container(&self, daemon_id: &str, grace_secs: i64) -> anyhow::Result<()> {
    self
      .docker
      .stop_container(daemon_id, Some(StopContainerOptions { t: grace_secs }))
      .await?;
    Ok(())
  }

  async fn remove_container(&self, daemon_id: &str, force: bool) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(daemon_id, Some(RemoveContainerOptions { force, v: false, link: false }))
      .await?;
    Ok(())
  }

  async fn tail_logs(
    &self,
    daemon_id: &str,
    options: &LogTailOptions,
  ) -> anyhow::Result<BoxStream<'static, anyhow::Result<LogLine>>> {
    let logs_options = LogsOptions::<String> {
      follow: options.follow,
      stdout: true,
      stderr: true,
      timestamps: options.timestamps,
      tail: options.tail.clone().unwrap_or_else(|| "all".to_string()),
      since: options.since.unwrap_or(0),
      ..Default::default()
    };
    let raw = self.docker.logs(daemon_id, Some(logs_options)).boxed();
    // bollard already demultiplexes the 8-byte-header framing into
    // `LogOutput` chunks, but those chunks don't align to line boundaries;
    // one decoder is threaded through every chunk so a line split across
    // two chunks is held back instead of emitted twice.
    let decoded = stream::unfold(
      (raw, FrameDecoder::new(), std::collections::VecDeque::new(), false),
      |(mut raw, mut decoder, mut queue, ended)| async move {
        loop {
          if let Some(line) = queue.pop_front() {
            return Some((line, (raw, decoder, queue, ended)));
          }
          if ended {
            return None;
          }
          match raw.next().await {
            Some(Ok(output)) => {
              let (kind_byte, bytes): (u8, Bytes) = match output {
                bollard::container::LogOutput::StdOut { message } => (1, message),
                bollard::container::LogOutput::StdErr { message } => (2, message),
                bollard::container::LogOutput::StdIn { message } => (1, message),
                bollard::container::LogOutput::Console { message } => (1, message),
              };
              let mut framed = vec![kind_byte, 0, 0, 0];
              framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
              framed.extend_from_slice(&bytes);
              decoder.push(&framed);
              queue.extend(decoder.drain_lines().into_iter().map(Ok));
            }
            Some(Err(e)) => queue.push_back(Err(anyhow::Error::from(e))),
            None => {
              queue.extend(decoder.flush().into_iter().map(Ok));
              let line = queue.pop_front()?;
              return Some((line, (raw, decoder, queue, true)));
            }
          }
        }
      },
    );
    Ok(Box::pin(decoded))
  }
}

fn restart_policy_name(policy: &str) -> Option<bollard::models::RestartPolicyNameEnum> {
  use bollard::models::RestartPolicyNameEnum::*;
  Some(match policy {
    "always" => ALWAYS,
    "on-failure" => ON_FAILURE,
    "unless-stopped" => UNLESS_STOPPED,
    _ => NO,
  })
}
