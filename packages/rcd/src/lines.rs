//! Newline reassembly for command input, device events and monitored files.

use bytes::BytesMut;
use tracing::warn;

/// Partial lines longer than this are dropped.
pub const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: BytesMut,
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every line completed by them.
    ///
    /// The newline and one preceding carriage return are stripped. Any
    /// trailing partial line is kept for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw = self.pending.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let mut line = &raw[..raw.len() - 1];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
        }

        if self.pending.len() > MAX_LINE {
            warn!(len = self.pending.len(), "dropping oversized partial line");
            self.pending.clear();
            self.discarding = true;
        }

        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
