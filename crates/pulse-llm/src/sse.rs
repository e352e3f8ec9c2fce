//! Server-sent event line framing
//!
//! Chunks from `bytes_stream()` split lines (and UTF-8 sequences) at
//! arbitrary points, so bytes are buffered until a newline arrives.

/// Longest line kept; tool results can make single frames very large
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
    /// Current line exceeded `max_line`; drop bytes until the next newline
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(head);
            lines.push(self.take_line());
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_line {
                tracing::warn!(limit = self.max_line, "Dropping oversized event stream line");
                self.buf.clear();
                self.discarding = true;
            }
        }
        lines
    }

    /// Trailing partial line once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() || self.discarding {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        let mut line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Payload of a `data:` line, `None` for comments, other fields and blanks
pub fn data_payload(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}
