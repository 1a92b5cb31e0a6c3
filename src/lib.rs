//! Chat client for Ollama-compatible model servers.
//!
//! The crate streams model responses as NDJSON, demultiplexes `<think>`
//! reasoning content, and intercepts inline tool calls the model emits in
//! its text, executing them and feeding the results back for a synthesis
//! pass. [`session::ChatSession`] is the entry point; everything below it
//! (stream decoding, thinking demux, tool parsing, the tool registry) is
//! usable on its own.

pub mod config;
pub mod conversation;
pub mod models;
pub mod protocol;
pub mod session;
pub mod stream_decoder;
pub mod thinking_parser;
pub mod token_estimate;
pub mod tool_parser;
pub mod tools;

pub use config::ChatConfig;
pub use protocol::{ChatEvent, ChatMessage, ChatRole, TokenUsage};
pub use session::ChatSession;
pub use tools::{StagedFile, ToolRegistry};
