//! Row types mirroring the persisted data model one-to-one. Columns are
//! read/written as plain SQL types (`TEXT`, `TIMESTAMPTZ`, `BOOLEAN`); state
//! enums round-trip through their `Display`/`FromStr` string form rather
//! than a native Postgres enum type, so the schema migration stays a
//! one-column-per-field affair for whoever owns it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
  Stopped,
  Starting,
  Running,
  Stopping,
  Restarting,
}

impl fmt::Display for ServiceState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ServiceState::Stopped => "stopped",
      ServiceState::Starting => "starting",
      ServiceState::Running => "running",
      ServiceState::Stopping => "stopping",
      ServiceState::Restarting => "restarting",
    };
    f.write_str(s)
  }
}

impl FromStr for ServiceState {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "stopped" => ServiceState::Stopped,
      "starting" => ServiceState::Starting,
      "running" => ServiceState::Running,
      "stopping" => ServiceState::Stopping,
      "restarting" => ServiceState::Restarting,
      other => anyhow::bail!("unknown service state \"{other}\""),
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
  Stopped,
  Running,
  Removed,
}

impl fmt::Display for ContainerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ContainerState::Stopped => "stopped",
      ContainerState::Running => "running",
      ContainerState::Removed => "removed",
    };
    f.write_str(s)
  }
}

impl FromStr for ContainerState {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "stopped" => ContainerState::Stopped,
      "running" => ContainerState::Running,
      "removed" => ContainerState::Removed,
      other => anyhow::bail!("unknown container state \"{other}\""),
    })
  }
}

#[derive(Debug, Clone)]
pub struct Service {
  pub id: String,
  pub team_id: String,
  pub project_id: String,
  pub server_id: String,
  pub name: String,
  pub state: ServiceState,
  pub last_deployed_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceComposeConfig {
  pub service_id: String,
  pub contents: String,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceSourceGit {
  pub service_id: String,
  pub repo_url: String,
  pub branch: Option<String>,
  pub compose_path: Option<String>,
  pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceContainer {
  pub id: String,
  pub service_id: String,
  pub logical_name: String,
  pub daemon_id: Option<String>,
  pub state: ContainerState,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceNetwork {
  pub id: String,
  pub service_id: String,
  pub logical_name: String,
  pub daemon_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceVolume {
  pub id: String,
  pub service_id: String,
  pub logical_name: String,
  pub daemon_id: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn service_state_round_trips_through_display() {
    for state in [
      ServiceState::Stopped,
      ServiceState::Starting,
      ServiceState::Running,
      ServiceState::Stopping,
      ServiceState::Restarting,
    ] {
      let parsed: ServiceState = state.to_string().parse().unwrap();
      assert_eq!(parsed, state);
    }
  }

  #[test]
  fn container_state_rejects_unknown() {
    assert!("bogus".parse::<ContainerState>().is_err());
  }
}
