//! Line framing over the raw TCP byte stream.
//!
//! The venue sends one JSON value per CRLF-terminated line. [`FrameReader`]
//! owns the trailing buffer for one connection epoch: bytes are appended as
//! they arrive, and complete lines are cut from the front. Between calls the
//! buffer only ever holds an incomplete line.

/// Accumulates socket bytes and yields complete, non-blank lines.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already known to contain no `\n`.
    scanned: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Cut the next non-blank line from the buffer.
    ///
    /// The terminator (`\n`, with an optional preceding `\r`) is stripped.
    /// Blank lines are consumed and skipped. Returns `None` once only an
    /// incomplete line remains.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let offset = self.buf[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(pos) = offset.map(|o| self.scanned + o) else {
                self.scanned = self.buf.len();
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            line.pop(); // '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let text = String::from_utf8(line).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
            if text.trim().is_empty() {
                continue;
            }
            return Some(text);
        }
    }

    /// Bytes of the incomplete trailing line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered bytes (start of a new epoch).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}
