//! Typed event multiplexer: one stream handle per operation run, several
//! bounded producer surfaces, a single merged consumer stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

const TEXT_QUEUE_CAPACITY: usize = 100;
const ERR_QUEUE_CAPACITY: usize = 100;
const PROGRESS_QUEUE_CAPACITY: usize = 100;
const TERMINAL_QUEUE_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
  Log,
  Step,
  Info,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
  pub id: String,
  pub status: String,
  pub current: Option<u64>,
  pub total: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum Event {
  Text { kind: TextKind, message: String },
  Progress(ProgressEvent),
  Err(String),
  Fatal { message: String, dropped_events: u64 },
  Done { dropped_events: u64 },
}

impl Event {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Event::Fatal { .. } | Event::Done { .. })
  }
}

/// Producer handle, cloneable and cheap — every remote-executor,
/// reconciler, and engine step that wants to emit progress holds a clone.
#[derive(Clone)]
pub struct EventHandle {
  text_tx: mpsc::Sender<(TextKind, String)>,
  err_tx: mpsc::Sender<String>,
  progress_tx: mpsc::Sender<ProgressEvent>,
  terminal_tx: mpsc::Sender<Event>,
  dropped: Arc<AtomicU64>,
  terminal_sent: Arc<AtomicBool>,
}

impl EventHandle {
  fn send_text(&self, kind: TextKind, message: impl Into<String>) {
    if self.terminal_sent.load(Ordering::Acquire) {
      return;
    }
    if self.text_tx.try_send((kind, message.into())).is_err() {
      self.dropped.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn log(&self, message: impl Into<String>) {
    self.send_text(TextKind::Log, message);
  }

  pub fn step(&self, message: impl Into<String>) {
    self.send_text(TextKind::Step, message);
  }

  pub fn info(&self, message: impl Into<String>) {
    self.send_text(TextKind::Info, message);
  }

  pub fn progress(
    &self,
    id: impl Into<String>,
    status: impl Into<String>,
    current: Option<u64>,
    total: Option<u64>,
  ) {
    if self.terminal_sent.load(Ordering::Acquire) {
      return;
    }
    let event = ProgressEvent {
      id: id.into(),
      status: status.into(),
      current,
      total,
    };
    if self.progress_tx.try_send(event).is_err() {
      self.dropped.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Non-fatal: the operation may continue.
  pub fn err(&self, message: impl Into<String>) {
    if self.terminal_sent.load(Ordering::Acquire) {
      return;
    }
    if self.err_tx.try_send(message.into()).is_err() {
      self.dropped.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Terminal. At most one of `fatal`/`done` is ever delivered per run;
  /// later calls are silently ignored.
  pub fn fatal(&self, message: impl Into<String>) {
    if self.terminal_sent.swap(true, Ordering::AcqRel) {
      return;
    }
    let dropped = self.dropped.load(Ordering::Relaxed);
    let _ = self.terminal_tx.try_send(Event::Fatal {
      message: message.into(),
      dropped_events: dropped,
    });
  }

  /// Terminal success.
  pub fn done(&self) {
    if self.terminal_sent.swap(true, Ordering::AcqRel) {
      return;
    }
    let dropped = self.dropped.load(Ordering::Relaxed);
    let _ = self.terminal_tx.try_send(Event::Done { dropped_events: dropped });
  }

  pub fn dropped_count(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

/// Consumer side: a merged sequence of events from every producer surface.
/// Ownership of the background forwarder task lives with this stream —
/// dropping it stops forwarding.
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<Event>,
  _forwarder: tokio::task::JoinHandle<()>,
}

impl EventStream {
  pub async fn recv(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Creates one operation run's event channel: a producer [`EventHandle`]
/// and the merged [`EventStream`] a consumer drains.
pub fn channel() -> (EventHandle, EventStream) {
  let (text_tx, mut text_rx) = mpsc::channel(TEXT_QUEUE_CAPACITY);
  let (err_tx, mut err_rx) = mpsc::channel(ERR_QUEUE_CAPACITY);
  let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_QUEUE_CAPACITY);
  let (terminal_tx, mut terminal_rx) = mpsc::channel(TERMINAL_QUEUE_CAPACITY);
  let (out_tx, out_rx) = mpsc::unbounded_channel();

  let forwarder = tokio::spawn(async move {
    loop {
      // Checked in this order so a terminal event already queued never
      // jumps ahead of text/err/progress events still waiting to be
      // drained from the same producer.
      tokio::select! {
        biased;
        maybe = text_rx.recv() => {
          match maybe {
            Some((kind, message)) => { let _ = out_tx.send(Event::Text { kind, message }); }
            None => continue,
          }
        }
        maybe = err_rx.recv() => {
          match maybe {
            Some(message) => { let _ = out_tx.send(Event::Err(message)); }
            None => continue,
          }
        }
        maybe = progress_rx.recv() => {
          match maybe {
            Some(event) => { let _ = out_tx.send(Event::Progress(event)); }
            None => continue,
          }
        }
        maybe = terminal_rx.recv() => {
          if let Some(event) = maybe {
            let _ = out_tx.send(event);
          }
          break;
        }
      }
    }
  });

  let handle = EventHandle {
    text_tx,
    err_tx,
    progress_tx,
    terminal_tx,
    dropped: Arc::new(AtomicU64::new(0)),
    terminal_sent: Arc::new(AtomicBool::new(false)),
  };
  let stream = EventStream { rx: out_rx, _forwarder: forwarder };
  (handle, stream)
}
