//! Newline-delimited JSON decoding
//!
//! Upstream bodies arrive in arbitrary byte chunks; a chunk may end in the
//! middle of a line or even in the middle of a multi-byte UTF-8 sequence.
//! The decoder buffers raw bytes and only decodes complete lines.
//!
//! Any line that cannot be decoded becomes a [`Fragment::Error`] and
//! decoding carries on with the next line. Lines longer than the limit are
//! reported once and skipped.

use super::traits::Fragment;
use crate::error::BackendError;

/// Minimum buffer capacity for the decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Default limit on a single line. Ollama's final line carries the whole
/// token context, so this is generous.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Streaming decoder turning body bytes into fragments, one per line.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Position up to which the pending line is known to hold no newline
    scan_pos: usize,
    /// Longest line accepted before it is reported and skipped
    max_line_bytes: usize,
    /// Dropping the rest of an overlong line until its newline arrives
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Create a new decoder with default buffer capacity and line limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a decoder that rejects lines longer than `max_line_bytes`
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            max_line_bytes,
            discarding: false,
        }
    }

    /// Number of buffered bytes not yet decoded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Append bytes and decode every line they complete.
    ///
    /// Blank lines are skipped. Each byte is scanned for a newline once.
    pub fn push(&mut self, data: &[u8]) -> Vec<Fragment> {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);

        let mut fragments = Vec::new();
        while let Some(offset) = self.buffer[self.scan_pos..]
            .iter()
            .position(|&b| b == b'\n')
        {
            let end = self.scan_pos + offset;
            if self.discarding {
                self.discarding = false;
            } else if let Some(fragment) = decode(&self.buffer[self.read_pos..end]) {
                fragments.push(fragment);
            }
            self.read_pos = end + 1;
            self.scan_pos = self.read_pos;
        }
        self.scan_pos = self.buffer.len();

        if !self.discarding && self.pending() > self.max_line_bytes {
            tracing::warn!(
                limit = self.max_line_bytes,
                "Upstream line exceeds limit, skipping it"
            );
            fragments.push(Fragment::Error(
                BackendError::Decode(format!(
                    "line exceeds {} bytes",
                    self.max_line_bytes
                ))
                .to_payload(),
            ));
            self.discarding = true;
        }
        if self.discarding {
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
        }

        fragments
    }

    /// Decode whatever is left once the body has ended.
    ///
    /// Servers are not required to terminate the last line.
    pub fn finish(&mut self) -> Option<Fragment> {
        let rest = if self.discarding {
            None
        } else {
            decode(&self.buffer[self.read_pos..])
        };
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
        self.discarding = false;
        rest
    }
}

fn decode(line: &[u8]) -> Option<Fragment> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(e) => {
            return Some(Fragment::Error(
                BackendError::Decode(format!("line is not valid UTF-8: {e}")).to_payload(),
            ));
        }
    };
    if line.is_empty() {
        None
    } else {
        Some(Fragment::decode_line(line))
    }
}
