//! Error kinds classified at the boundary. Internal code returns
//! `anyhow::Result` and adds context freely; only the operation engine and
//! the streaming bridge ever construct an [`EngineError`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Validation,
  Conflict,
  Remote,
  Persistence,
  Cancelled,
  Internal,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorKind::Validation => "validation",
      ErrorKind::Conflict => "conflict",
      ErrorKind::Remote => "remote",
      ErrorKind::Persistence => "persistence",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::Internal => "internal",
    };
    f.write_str(s)
  }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source:#}")]
pub struct EngineError {
  pub kind: ErrorKind,
  #[source]
  pub source: anyhow::Error,
}

impl EngineError {
  pub fn new(
    kind: ErrorKind,
    source: impl Into<anyhow::Error>,
  ) -> Self {
    EngineError { kind, source: source.into() }
  }

  pub fn validation(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Validation, source)
  }

  pub fn conflict(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Conflict, source)
  }

  pub fn remote(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Remote, source)
  }

  pub fn persistence(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Persistence, source)
  }

  pub fn cancelled(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Cancelled, source)
  }

  pub fn internal(source: impl Into<anyhow::Error>) -> Self {
    Self::new(ErrorKind::Internal, source)
  }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_includes_kind_and_cause() {
    let err = EngineError::conflict(anyhow::anyhow!("name already in use"));
    let rendered = format!("{err}");
    assert!(rendered.starts_with("conflict:"));
    assert!(rendered.contains("name already in use"));
  }
}
