use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One entry of the conversation history. Append-only once pushed; a failed
/// assistant turn is never appended at all.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: None,
        }
    }

    pub fn with_images(role: ChatRole, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Some(images),
        }
    }
}

/// Sampling options forwarded verbatim in the request `options` object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub num_predict: i64,
    pub top_p: f64,
    pub top_k: i64,
    pub repeat_penalty: f64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            num_predict: 2048,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub options: GenerationOptions,
}

/// One decoded line of the newline-delimited JSON response body.
///
/// Transient: folded into accumulators by the session, never stored.
#[derive(Debug, Default, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub message: Option<EnvelopeMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvelopeMessage {
    #[serde(default)]
    pub content: String,
}

/// Final token accounting for one request, latched from the most recent
/// envelope that carried the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

/// Incremental render notifications emitted while a turn is in flight.
///
/// The UI boundary consumes these; send failures are ignored so a dropped
/// receiver never aborts a turn.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// Regular (non-thinking) content delta.
    Chunk(String),
    /// Thinking-block content delta.
    Thinking(String),
    /// Already-rendered content was reclassified (a thinking marker
    /// completed across a chunk boundary, or detection armed late); the
    /// renderer must replace its buffers with this full state.
    Revised { regular: String, thinking: String },
    /// Tool execution started.
    ToolStarted { id: String, name: String },
    /// Tool execution finished; `ok` is false when the result records a failure.
    ToolFinished { id: String, name: String, ok: bool },
    /// Second streaming pass (after tool results) has begun.
    SynthesisStarted,
    /// Turn finished; counters latched from the last envelope that had them.
    Done(TokenUsage),
    /// Soft warning rendered inline (e.g. empty synthesis response).
    Warning(String),
    /// Turn-level failure rendered inline.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let msg = ChatMessage::new(ChatRole::Assistant, "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
        assert!(!json.contains("images"));
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: StreamEnvelope = serde_json::from_str("{}").unwrap();
        assert!(env.message.is_none());
        assert!(!env.done);
        assert!(env.prompt_eval_count.is_none());
    }

    #[test]
    fn envelope_parses_final_frame() {
        let env: StreamEnvelope =
            serde_json::from_str(r#"{"done":true,"prompt_eval_count":5,"eval_count":1}"#).unwrap();
        assert!(env.done);
        assert_eq!(env.prompt_eval_count, Some(5));
        assert_eq!(env.eval_count, Some(1));
    }

    #[test]
    fn images_round_trip() {
        let msg = ChatMessage::with_images(ChatRole::User, "look", vec!["aGVsbG8=".to_string()]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("aGVsbG8="));
    }
}
