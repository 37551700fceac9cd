//! Streaming Bridge: turns one operation's [`EventStream`] into a sequence
//! of wire-level envelopes, and performs the secondary ("T2") database
//! transaction when a terminal event arrives — detached from whether anyone
//! is still listening.

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::db::{self, models::ServiceState};
use crate::engine::Operation;
use crate::events::{Event, EventStream, TextKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireEventKind {
  Starting,
  Log { message: String },
  Step { message: String },
  Info { message: String },
  Progress { id: String, status: String, current: Option<u64>, total: Option<u64> },
  Err { message: String },
  Done { dropped_events: u64 },
  Fatal { message: String, dropped_events: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
  pub service_id: String,
  pub sequence: u64,
  #[serde(flatten)]
  pub kind: WireEventKind,
}

fn to_wire_kind(event: Event) -> WireEventKind {
  match event {
    Event::Text { kind: TextKind::Log, message } => WireEventKind::Log { message },
    Event::Text { kind: TextKind::Step, message } => WireEventKind::Step { message },
    Event::Text { kind: TextKind::Info, message } => WireEventKind::Info { message },
    Event::Progress(p) => WireEventKind::Progress {
      id: p.id,
      status: p.status,
      current: p.current,
      total: p.total,
    },
    Event::Err(message) => WireEventKind::Err { message },
    Event::Done { dropped_events } => WireEventKind::Done { dropped_events },
    Event::Fatal { message, dropped_events } => WireEventKind::Fatal { message, dropped_events },
  }
}

/// The service state an operation settles into once it finishes
/// successfully, and whether that also touches `last_deployed_at`.
fn settled_state(op: Operation) -> (ServiceState, bool) {
  match op {
    Operation::Start => (ServiceState::Running, true),
    Operation::Stop => (ServiceState::Stopped, false),
    Operation::Restart => (ServiceState::Running, true),
  }
}

/// Spawns a detached forwarder: drains `inner`, maps every event to a
/// [`WireEvent`], and on the terminal event commits T2 before emitting it.
/// The forwarder keeps running to completion even if `rx`'s other half is
/// dropped mid-stream — the consumer disconnecting doesn't cancel the
/// operation's database bookkeeping.
pub fn bind(
  pool: PgPool,
  service_id: String,
  op: Operation,
  mut inner: EventStream,
) -> mpsc::UnboundedReceiver<WireEvent> {
  let (tx, rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    let mut sequence: u64 = 0;
    let _ = tx.send(WireEvent {
      service_id: service_id.clone(),
      sequence,
      kind: WireEventKind::Starting,
    });

    while let Some(event) = inner.recv().await {
      let is_terminal = event.is_terminal();
      let is_success = matches!(event, Event::Done { .. });

      if is_terminal {
        if let Err(e) = commit_terminal_state(&pool, &service_id, op, is_success).await {
          sequence += 1;
          let _ = tx.send(WireEvent {
            service_id: service_id.clone(),
            sequence,
            kind: WireEventKind::Err {
              message: format!("terminal state commit failed: {e:#}"),
            },
          });
        }
      }

      sequence += 1;
      let _ = tx.send(WireEvent {
        service_id: service_id.clone(),
        sequence,
        kind: to_wire_kind(event),
      });

      if is_terminal {
        break;
      }
    }
  });

  rx
}

async fn commit_terminal_state(
  pool: &PgPool,
  service_id: &str,
  op: Operation,
  success: bool,
) -> anyhow::Result<()> {
  let mut tx = pool.begin().await?;
  if success {
    let (state, touch_last_deployed_at) = settled_state(op);
    db::update_service_state(&mut tx, service_id, state, touch_last_deployed_at)
      .await
      .map_err(anyhow::Error::from)?;
  } else {
    // A fatal run rolls the service back to stopped, whatever operation it
    // was attempting, without touching last_deployed_at.
    db::update_service_state(&mut tx, service_id, ServiceState::Stopped, false)
      .await
      .map_err(anyhow::Error::from)?;
  }
  tx.commit().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::ProgressEvent;

  #[test]
  fn settled_state_marks_start_and_restart_as_running() {
    assert_eq!(settled_state(Operation::Start).0, ServiceState::Running);
    assert!(settled_state(Operation::Start).1);
    assert_eq!(settled_state(Operation::Restart).0, ServiceState::Running);
    assert_eq!(settled_state(Operation::Stop).0, ServiceState::Stopped);
    assert!(!settled_state(Operation::Stop).1);
  }

  #[test]
  fn to_wire_kind_preserves_progress_fields() {
    let event = Event::Progress(ProgressEvent {
      id: "img".into(),
      status: "Downloading".into(),
      current: Some(10),
      total: Some(100),
    });
    match to_wire_kind(event) {
      WireEventKind::Progress { id, status, current, total } => {
        assert_eq!(id, "img");
        assert_eq!(status, "Downloading");
        assert_eq!(current, Some(10));
        assert_eq!(total, Some(100));
      }
      other => panic!("unexpected kind: {other:?}"),
    }
  }
}
