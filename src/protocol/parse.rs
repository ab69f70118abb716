use anyhow::Result;

use super::types::StreamEvent;

/// Parse a single NDJSON line into a `StreamEvent`.
///
/// Returns `Ok(None)` for empty lines.
/// Returns `Err` for malformed JSON (caller should warn, not crash).
pub fn parse_line(line: &str) -> Result<Option<StreamEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: StreamEvent = serde_json::from_str(line)?;
    Ok(Some(event))
}

/// Splits a byte stream into complete `\n`-terminated lines.
///
/// Bytes after the last newline stay buffered until the next `push`, so a
/// short read never yields half a JSON object.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    /// Feed a chunk and return every line it completed, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Bytes received since the last complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
