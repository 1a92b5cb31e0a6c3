//! Splits a streamed character sequence into "thinking" and regular content.
//!
//! Markers are the literal `<think>` / `</think>` pair. Because a marker may
//! straddle chunk boundaries (`<th` in one chunk, `ink>` in the next), the
//! accumulators persist across pushes and marker detection runs against their
//! trailing bytes rather than against the current chunk alone.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Net effect of one pushed chunk on the two accumulators.
///
/// When `revised` is set, previously-reported content has been reclassified
/// (a marker completed across a chunk boundary, or the demultiplexer armed
/// late and reprocessed the whole response); the renderer must re-pull the
/// full accumulator state instead of appending deltas.
#[derive(Debug, Default, PartialEq)]
pub struct PushResult {
    pub regular_delta: String,
    pub thinking_delta: String,
    pub revised: bool,
}

/// Streaming demultiplexer state, scoped to one turn.
pub struct ThinkingParser {
    /// Demultiplexing enabled, either ahead of time (model capability flag)
    /// or armed mid-stream on first sight of the open marker.
    active: bool,
    reprocessed: bool,
    inside: bool,
    full_text: String,
    regular: String,
    thinking: String,
}

impl ThinkingParser {
    /// `enabled` comes from the per-model capability flag. Even when false,
    /// the parser arms itself dynamically if the open marker shows up.
    pub fn new(enabled: bool) -> Self {
        Self {
            active: enabled,
            reprocessed: false,
            inside: false,
            full_text: String::new(),
            regular: String::new(),
            thinking: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_inside(&self) -> bool {
        self.inside
    }

    pub fn regular(&self) -> &str {
        &self.regular
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    /// Full raw response as received, markers included.
    pub fn raw(&self) -> &str {
        &self.full_text
    }

    pub fn push(&mut self, chunk: &str) -> PushResult {
        let prev_regular_len = self.regular.len();
        let prev_thinking_len = self.thinking.len();

        let mut search_from = self
            .full_text
            .len()
            .saturating_sub(OPEN_TAG.len() - 1);
        self.full_text.push_str(chunk);
        // The lookback is a byte offset and may land inside a multibyte
        // character; back it up to the nearest char boundary.
        while !self.full_text.is_char_boundary(search_from) {
            search_from -= 1;
        }

        if !self.active {
            // Marker detection needs only a lookback of the marker length
            // across the chunk seam.
            if self.full_text[search_from..].contains(OPEN_TAG) {
                eprintln!("[THINKING] Open marker detected mid-stream, reprocessing response");
                self.arm();
                return PushResult {
                    regular_delta: String::new(),
                    thinking_delta: String::new(),
                    revised: true,
                };
            }
            self.regular.push_str(chunk);
            return PushResult {
                regular_delta: chunk.to_string(),
                thinking_delta: String::new(),
                revised: false,
            };
        }

        // A retraction rewinds past a previous push only when the marker
        // straddled the boundary; watermarks catch that even if this push
        // then grows the accumulator past its old length again.
        let mut revised = false;
        for c in chunk.chars() {
            if !self.inside {
                self.regular.push(c);
                if self.regular.ends_with(OPEN_TAG) {
                    let len = self.regular.len() - OPEN_TAG.len();
                    if len < prev_regular_len {
                        revised = true;
                    }
                    self.regular.truncate(len);
                    self.inside = true;
                }
            } else {
                self.thinking.push(c);
                if self.thinking.ends_with(CLOSE_TAG) {
                    let len = self.thinking.len() - CLOSE_TAG.len();
                    if len < prev_thinking_len {
                        revised = true;
                    }
                    self.thinking.truncate(len);
                    self.inside = false;
                }
            }
        }

        if revised {
            PushResult {
                regular_delta: String::new(),
                thinking_delta: String::new(),
                revised: true,
            }
        } else {
            PushResult {
                regular_delta: self.regular[prev_regular_len..].to_string(),
                thinking_delta: self.thinking[prev_thinking_len..].to_string(),
                revised: false,
            }
        }
    }

    /// One-shot late-detection fallback: everything classified so far is
    /// thrown away and the full accumulated response is re-run through the
    /// character classifier. Happens at most once per turn.
    fn arm(&mut self) {
        debug_assert!(!self.reprocessed, "late arming must trigger at most once");
        self.active = true;
        self.reprocessed = true;
        self.inside = false;
        self.regular.clear();
        self.thinking.clear();
        let full = std::mem::take(&mut self.full_text);
        for c in full.chars() {
            if !self.inside {
                self.regular.push(c);
                if self.regular.ends_with(OPEN_TAG) {
                    // Retract the marker prefix already appended.
                    let len = self.regular.len() - OPEN_TAG.len();
                    self.regular.truncate(len);
                    self.inside = true;
                }
            } else {
                self.thinking.push(c);
                if self.thinking.ends_with(CLOSE_TAG) {
                    let len = self.thinking.len() - CLOSE_TAG.len();
                    self.thinking.truncate(len);
                    self.inside = false;
                }
            }
        }
        self.full_text = full;
    }
}
