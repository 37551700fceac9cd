//! Decodes the container daemon's multiplexed log framing: an 8-byte header
//! per frame — byte 0 is the stream kind (1 = stdout, 2 = stderr), bytes
//! 4..8 are a big-endian payload length — then the payload, split on line
//! boundaries with empty lines dropped.

use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  Stdout,
  Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
  pub stream: StreamKind,
  pub line: String,
}

/// Incremental frame+line decoder. Feed it bytes as they arrive over the
/// wire (`push`); drain completed lines with `drain_lines`. Keeps partial
/// frames and partial lines buffered across calls.
#[derive(Default)]
pub struct FrameDecoder {
  buf: BytesMut,
  pending: Vec<(StreamKind, BytesMut)>,
}

impl FrameDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
    self.drain_frames();
  }

  fn drain_frames(&mut self) {
    loop {
      if self.buf.len() < 8 {
        return;
      }
      let header = &self.buf[0..8];
      let kind = match header[0] {
        1 => StreamKind::Stdout,
        2 => StreamKind::Stderr,
        // Non-demultiplexed (TTY) streams carry no header; treat as stdout
        // rather than drop the data.
        _ => StreamKind::Stdout,
      };
      let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
      if self.buf.len() < 8 + len {
        return;
      }
      self.buf.advance(8);
      let payload = self.buf.split_to(len);
      match self.pending.last_mut() {
        Some((last_kind, bytes)) if *last_kind == kind => bytes.extend_from_slice(&payload),
        _ => self.pending.push((kind, BytesMut::from(&payload[..]))),
      }
    }
  }

  /// Splits every buffered frame payload on line boundaries, dropping
  /// empty lines, and returns the completed lines tagged by stream kind.
  /// A payload without a trailing newline is held back until more data
  /// (or `flush`) completes it.
  pub fn drain_lines(&mut self) -> Vec<LogLine> {
    let mut out = Vec::new();
    let mut remaining = Vec::new();
    for (kind, mut bytes) in self.pending.drain(..) {
      let mut start = 0;
      while let Some(pos) = bytes[start..].iter().position(|b| *b == b'\n') {
        let end = start + pos;
        let line = &bytes[start..end];
        if !line.is_empty() {
          out.push(LogLine { stream: kind, line: String::from_utf8_lossy(line).into_owned() });
        }
        start = end + 1;
      }
      if start < bytes.len() {
        let leftover = bytes.split_off(start);
        remaining.push((kind, leftover));
      }
    }
    self.pending = remaining;
    out
  }

  /// Flushes any partial trailing line (no newline ever arrived) as a
  /// final line — called once the stream ends.
  pub fn flush(&mut self) -> Vec<LogLine> {
    let mut out = self.drain_lines();
    for (kind, bytes) in self.pending.drain(..) {
      if !bytes.is_empty() {
        out.push(LogLine { stream: kind, line: String::from_utf8_lossy(&bytes).into_owned() });
      }
    }
    out
  }
}

/// One-shot decode of a complete buffer, convenience wrapper around
/// [`FrameDecoder`] for tests and for transports that hand over the whole
/// payload at once.
pub fn decode_frames(bytes: &[u8]) -> Vec<LogLine> {
  let mut decoder = FrameDecoder::new();
  decoder.push(bytes);
  decoder.flush()
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
  let mut out = vec![kind, 0, 0, 0];
  out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
  out.extend_from_slice(payload);
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_single_stdout_frame() {
    let bytes = frame(1, b"hello world\n");
    let lines = decode_frames(&bytes);
    assert_eq!(lines, vec![LogLine { stream: StreamKind::Stdout, line: "hello world".into() }]);
  }

  #[test]
  fn tags_stderr_separately_from_stdout() {
    let mut bytes = frame(1, b"out line\n");
    bytes.extend(frame(2, b"err line\n"));
    let lines = decode_frames(&bytes);
    assert_eq!(
      lines,
      vec![
        LogLine { stream: StreamKind::Stdout, line: "out line".into() },
        LogLine { stream: StreamKind::Stderr, line: "err line".into() },
      ]
    );
  }

  #[test]
  fn drops_empty_lines() {
    let bytes = frame(1, b"a\n\nb\n");
    let lines = decode_frames(&bytes);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].line, "a");
    assert_eq!(lines[1].line, "b");
  }

  #[test]
  fn splits_multiple_lines_in_one_payload() {
    let bytes = frame(1, b"line1\nline2\nline3\n");
    let lines = decode_frames(&bytes);
    assert_eq!(lines.len(), 3);
  }

  #[test]
  fn holds_partial_frame_across_pushes() {
    let mut decoder = FrameDecoder::new();
    let whole = frame(1, b"split across pushes\n");
    let (first, second) = whole.split_at(5);
    decoder.push(first);
    assert!(decoder.drain_lines().is_empty());
    decoder.push(second);
    let lines = decoder.drain_lines();
    assert_eq!(lines[0].line, "split across pushes");
  }

  #[test]
  fn flush_emits_trailing_line_without_newline() {
    let mut decoder = FrameDecoder::new();
    decoder.push(&frame(1, b"no newline yet"));
    assert!(decoder.drain_lines().is_empty());
    let lines = decoder.flush();
    assert_eq!(lines, vec![LogLine { stream: StreamKind::Stdout, line: "no newline yet".into() }]);
  }
}
