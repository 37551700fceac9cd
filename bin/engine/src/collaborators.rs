//! Trait seams for the external collaborators the engine assumes: the SSH +
//! daemon-client pool keyed by `(team, server)`, and the compose-YAML
//! parser. Keeping these behind traits is what lets the operation engine be
//! driven against fakes in tests instead of a real remote host.

use std::sync::Arc;

use async_trait::async_trait;
use command::Log;

use crate::manifest::Project;
use crate::remote::DaemonClient;

/// Runs a single command over an existing SSH session: `mkdir -p`, `rm -rf`,
/// `test -d`/`test -f`, `cat`, git commands, the build-context tar pipe.
#[async_trait]
pub trait SshSession: Send + Sync {
  async fn run(&self, command: &str) -> anyhow::Result<Log>;

  /// Same as `run`, but for the one command whose stdout is binary (the
  /// build-context tar pipe: `tar -cf - -C <buildCtx> .`).
  async fn run_binary(&self, command: &str) -> anyhow::Result<Vec<u8>>;
}

/// Yields a daemon client and an SSH session for one `(team, server)`
/// pair, multiplexed over one SSH tunnel. Session creation is serialised by
/// the pool; the returned daemon client is safe for concurrent use by
/// multiple in-flight operations.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
  async fn connect(
    &self,
    team_id: &str,
    server_id: &str,
  ) -> anyhow::Result<(Arc<dyn DaemonClient>, Arc<dyn SshSession>)>;
}

/// Parses canonical compose-style YAML text into a [`Project`] with
/// services, volumes, networks, and `depends_on`.
pub trait ManifestParser: Send + Sync {
  fn parse(&self, contents: &str) -> anyhow::Result<Project>;
}
