//! Line splitting for encoder diagnostic output.
//!
//! FFmpeg terminates its live status line with `\r` rather than `\n`, so a
//! plain `lines()` reader would only yield progress once the process exits.

use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Lines longer than this are emitted in pieces.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream on `\r` and `\n`, skipping blank lines.
///
/// Invalid UTF-8 is replaced rather than rejected. [`DiagnosticLines::next_line`]
/// is cancel safe: no data is lost if its future is dropped.
pub struct DiagnosticLines<R> {
    reader: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Next non-empty line, or `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            if self.buf.len() >= MAX_LINE_BYTES || (self.eof && !self.buf.is_empty()) {
                let raw = std::mem::take(&mut self.buf);
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            if self.eof {
                return Ok(None);
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// The last few non-progress lines, kept to explain a failed encode.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    /// Retained lines joined with newlines, oldest first.
    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
