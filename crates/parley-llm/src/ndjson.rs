use parley_core::errors::BackendError;

use crate::wire::ChatChunk;

/// Incremental newline-delimited JSON decoder.
///
/// Bytes are buffered until a newline so objects (and multi-byte UTF-8
/// sequences) split across network reads decode intact. Blank lines are skipped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every complete line decoded in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<ChatChunk, BackendError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.extend(decode_line(&line));
        }
        out
    }

    /// Decode whatever remains after end of data (a final line without a newline).
    pub fn finish(&mut self) -> Option<Result<ChatChunk, BackendError>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<ChatChunk, BackendError>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(trimmed).map_err(|e| BackendError::Decode(e.to_string())))
}
