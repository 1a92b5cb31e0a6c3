use crate::protocol::StreamEnvelope;

/// Reassembles newline-delimited JSON lines from arbitrarily-chunked bytes.
///
/// A line may span several chunks and a chunk may contain several lines; the
/// last segment after splitting is always retained as the new buffer. The
/// buffer holds raw bytes so a multibyte character split across chunks is
/// reassembled before any decoding happens. One decoder instance per
/// streaming request.
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed one raw chunk; returns every envelope completed by it.
    ///
    /// Lines that fail to parse as JSON are logged and dropped. This is a
    /// per-line recoverable condition, never a stream-level failure.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEnvelope> {
        self.buffer.extend_from_slice(bytes);

        let mut envelopes = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            if let Some(env) = parse_line(String::from_utf8_lossy(&line).trim()) {
                envelopes.push(env);
            }
        }
        envelopes
    }

    /// Stream ended; parse whatever non-whitespace content is still buffered
    /// as one final line.
    pub fn finish(&mut self) -> Option<StreamEnvelope> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(String::from_utf8_lossy(&rest).trim())
    }
}

fn parse_line(line: &str) -> Option<StreamEnvelope> {
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEnvelope>(line) {
        Ok(env) => Some(env),
        Err(e) => {
            eprintln!("[STREAM] Dropping malformed line: {} (line: {:.200})", e, line);
            None
        }
    }
}
