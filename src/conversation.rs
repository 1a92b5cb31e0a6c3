use crate::protocol::{ChatMessage, ChatRole};

/// Ordered, append-only conversation history for one session.
///
/// Process-lifetime state: reset only by an explicit clear, never persisted.
/// The session is the sole writer; within a turn the append order is
/// user message, assistant tool-call message, tool result messages in parse
/// order, assistant synthesis message.
#[derive(Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Build the request message list: optional system prompt first, then
    /// the full history. The system prompt is request-scoped and never
    /// stored in the history itself.
    pub fn build_api_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::new(ChatRole::System, system_prompt));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}
