use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::OnceLock,
};

mod output;

pub use output::*;
use tokio::process::Command;

/// A single executed-command record, suitable for forwarding
/// into an event stream as a `log`/`step` entry.
#[derive(Debug, Clone)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn error(stage: impl Into<String>, stderr: impl Into<String>) -> Log {
    let ts = unix_timestamp_ms();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: String::new(),
      stderr: stderr.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
    }
  }

  pub fn simple(stage: impl Into<String>, stdout: impl Into<String>) -> Log {
    let ts = unix_timestamp_ms();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: stdout.into(),
      stderr: String::new(),
      success: true,
      start_ts: ts,
      end_ts: ts,
    }
  }
}

pub fn unix_timestamp_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// Commands are run directly, and cannot include '&&'
pub async fn run_standard_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> Log {
  let command = command.into();
  let start_ts = unix_timestamp_ms();
  let output = standard_command_output(&command, path).await;
  output_into_log(stage, command, start_ts, output)
}

/// Commands are wrapped in 'sh -c', and can include '&&'
pub async fn run_shell_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> Log {
  let command = command.into();
  let start_ts = unix_timestamp_ms();
  let output = shell_command_output(&command, path).await;
  output_into_log(stage, command, start_ts, output)
}

/// Parses commands out of a multiline string, dropping full-line and
/// end-of-line `#` comments, and chains the remaining lines with '&&'.
/// The result is empty if every line was a comment.
pub fn parse_multiline_command(command: impl AsRef<str>) -> String {
  command
    .as_ref()
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .map(|line| match line.split_once(" #") {
      Some((cmd, _comment)) => cmd.trim_end(),
      None => line,
    })
    .collect::<Vec<_>>()
    .join(" && ")
}

pub async fn run_multiline_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Option<Log> {
  let command = parse_multiline_command(command);
  if command.is_empty() {
    return None;
  }
  Some(run_shell_command(stage, path, command).await)
}

/// Runs the command and replaces every `(from, to)` pair in
/// `replacers` across command/stdout/stderr, to avoid leaking
/// interpolated secrets into a persisted log.
pub async fn run_command_with_sanitization(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
  replacers: &[(String, String)],
) -> Log {
  let mut log =
    run_shell_command(stage, path, command).await;
  log.command = replace_all(&log.command, replacers);
  log.stdout = replace_all(&log.stdout, replacers);
  log.stderr = replace_all(&log.stderr, replacers);
  log
}

fn replace_all(input: &str, replacers: &[(String, String)]) -> String {
  let mut out = input.to_string();
  for (from, to) in replacers {
    out = out.replace(from.as_str(), to.as_str());
  }
  out
}

fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: unix_timestamp_ms(),
  }
}

/// Commands are run directly, and cannot include '&&'
pub async fn standard_command_output(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let Some(lexed) = shlex::split(command).filter(|v| !v.is_empty())
  else {
    return CommandOutput::from_err(std::io::Error::other(
      "Command lexed into empty args",
    ));
  };

  let mut cmd = Command::new(&lexed[0]);

  cmd
    .args(&lexed[1..])
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}

fn shell() -> &'static str {
  static DEFAULT_SHELL: OnceLock<String> = OnceLock::new();
  DEFAULT_SHELL.get_or_init(|| {
    if PathBuf::from("/bin/bash").exists()
      || PathBuf::from("/usr/bin/bash").exists()
    {
      String::from("bash")
    } else {
      String::from("sh")
    }
  })
}

/// Commands are wrapped in 'sh -c', and can include '&&'
pub async fn shell_command_output(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut cmd = Command::new(shell());

  cmd.args(["-c", command]).kill_on_drop(true).stdin(Stdio::null());

  if let Some(path) = path.into() {
    match path.canonicalize() {
      Ok(path) => {
        cmd.current_dir(path);
      }
      Err(e) => return CommandOutput::from_err(e),
    }
  }

  CommandOutput::from(cmd.output().await)
}
