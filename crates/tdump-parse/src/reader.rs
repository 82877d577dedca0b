//! Line reader with explicit checkpoints.
//!
//! Lines are buffered only while a checkpoint is outstanding, so a probe can
//! read ahead and then put everything back exactly where it was.

use std::collections::VecDeque;
use std::io::{self, BufRead};

/// Saved reader position. Must be handed back through
/// [`LineReader::rewind`] or [`LineReader::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Checkpoint {
    line: u64,
    offset: u64,
}

impl Checkpoint {
    /// Byte offset of the line the checkpoint points at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of lines consumed before the checkpoint.
    pub fn line(&self) -> u64 {
        self.line
    }
}

#[derive(Debug)]
struct BufferedLine {
    text: String,
    /// Raw length in bytes, terminator included.
    len: u64,
}

pub struct LineReader<R> {
    inner: R,
    buffer: VecDeque<BufferedLine>,
    /// Line number of `buffer[0]`.
    buffer_start: u64,
    /// Lines consumed so far.
    line: u64,
    /// Byte offset of the next line.
    offset: u64,
    pins: Vec<u64>,
    last_line: String,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: VecDeque::new(),
            buffer_start: 0,
            line: 0,
            offset: 0,
            pins: Vec::new(),
            last_line: String::new(),
        }
    }

    /// Byte offset of the next line to be read.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Number of lines consumed so far; also the 1-based number of the last
    /// line returned.
    pub fn line_number(&self) -> u64 {
        self.line
    }

    /// The most recently consumed line.
    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    /// Return the next line without consuming it.
    pub fn peek_line(&mut self) -> io::Result<Option<&str>> {
        if !self.fill(self.line)? {
            return Ok(None);
        }
        let idx = (self.line - self.buffer_start) as usize;
        Ok(Some(self.buffer[idx].text.as_str()))
    }

    /// Consume and return the next line, without its terminator.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        if !self.fill(self.line)? {
            return Ok(None);
        }
        let idx = (self.line - self.buffer_start) as usize;
        let entry = &self.buffer[idx];
        let text = entry.text.clone();
        self.offset += entry.len;
        self.line += 1;
        self.last_line.clone_from(&text);
        self.trim();
        Ok(Some(text))
    }

    /// Consume the next line, discarding it.
    pub fn advance(&mut self) -> io::Result<bool> {
        Ok(self.next_line()?.is_some())
    }

    pub fn checkpoint(&mut self) -> Checkpoint {
        self.pins.push(self.line);
        Checkpoint {
            line: self.line,
            offset: self.offset,
        }
    }

    /// Go back to `checkpoint`. Lines read since are read again.
    pub fn rewind(&mut self, checkpoint: Checkpoint) {
        self.line = checkpoint.line;
        self.offset = checkpoint.offset;
        self.unpin(checkpoint.line);
        self.trim();
    }

    /// Forget `checkpoint`, keeping the current position.
    pub fn release(&mut self, checkpoint: Checkpoint) {
        self.unpin(checkpoint.line);
        self.trim();
    }

    fn unpin(&mut self, line: u64) {
        if let Some(pos) = self.pins.iter().rposition(|&p| p == line) {
            self.pins.swap_remove(pos);
        }
    }

    /// Drop buffered lines nobody can rewind to any more.
    fn trim(&mut self) {
        let keep_from = self.pins.iter().copied().min().unwrap_or(self.line).min(self.line);
        while self.buffer_start < keep_from && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.buffer_start += 1;
        }
    }

    /// Make sure line `target` is buffered. Returns false at end of input.
    fn fill(&mut self, target: u64) -> io::Result<bool> {
        while self.buffer_start + self.buffer.len() as u64 <= target {
            let mut raw = Vec::new();
            let len = self.inner.read_until(b'\n', &mut raw)?;
            if len == 0 {
                return Ok(false);
            }
            if raw.last() == Some(&b'\n') {
                raw.pop();
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
            }
            self.buffer.push_back(BufferedLine {
                text: String::from_utf8_lossy(&raw).into_owned(),
                len: len as u64,
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &str) -> LineReader<Cursor<Vec<u8>>> {
        LineReader::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn strips_terminators_and_tracks_offsets() {
        let mut r = reader("one\r\ntwo\nthree");
        assert_eq!(r.next_line().unwrap().as_deref(), Some("one"));
        assert_eq!(r.position(), 5);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("two"));
        assert_eq!(r.position(), 9);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("three"));
        assert_eq!(r.position(), 14);
        assert_eq!(r.next_line().unwrap(), None);
        assert_eq!(r.line_number(), 3);
    }

    #[test]
    fn rewind_restores_exact_position() {
        let mut r = reader("a\nb\nc\nd\n");
        r.advance().unwrap();
        let cp = r.checkpoint();
        let before = r.position();
        r.advance().unwrap();
        r.advance().unwrap();
        r.rewind(cp);
        assert_eq!(r.position(), before);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("b"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn nested_checkpoints_keep_outer_lines() {
        let mut r = reader("a\nb\nc\n");
        let outer = r.checkpoint();
        r.advance().unwrap();
        let inner = r.checkpoint();
        r.advance().unwrap();
        r.release(inner);
        assert_eq!(r.peek_line().unwrap(), Some("c"));
        r.rewind(outer);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.line_number(), 1);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut r = reader("x\ny\n");
        assert_eq!(r.peek_line().unwrap(), Some("x"));
        assert_eq!(r.peek_line().unwrap(), Some("x"));
        assert_eq!(r.position(), 0);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("x"));
        assert_eq!(r.last_line(), "x");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut r = LineReader::new(Cursor::new(b"caf\xe9\n".to_vec()));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("caf\u{fffd}"));
    }
}
