//! Conversation orchestrator: drives one full turn against the model server.
//!
//! A turn is send request -> consume stream -> detect tool calls -> execute
//! tools sequentially -> synthesis request -> reconcile history. The session
//! object owns all turn state (history, staged file, single-flight lock);
//! nothing lives in module globals.

use std::sync::mpsc::Sender;

use futures_util::StreamExt;
use serde_json::{Map, Value};

use crate::config::ChatConfig;
use crate::conversation::ConversationHistory;
use crate::models::detect_capabilities;
use crate::protocol::{ChatEvent, ChatMessage, ChatRequest, ChatRole, TokenUsage};
use crate::stream_decoder::LineDecoder;
use crate::thinking_parser::ThinkingParser;
use crate::tool_parser::{parse_tool_calls, ParsedToolCall};
use crate::tools::{StagedFile, ToolRegistry, ToolRuntime};

/// Final state of one streaming request after the stream fully completed.
struct StreamOutcome {
    raw: String,
    regular: String,
    demuxed: bool,
    usage: TokenUsage,
}

pub struct ChatSession {
    http: reqwest::Client,
    pub config: ChatConfig,
    history: ConversationHistory,
    registry: ToolRegistry,
    staged_file: Option<StagedFile>,
    busy: bool,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Self {
        Self::with_registry(config, ToolRegistry::builtin())
    }

    pub fn with_registry(config: ChatConfig, registry: ToolRegistry) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            history: ConversationHistory::new(),
            registry,
            staged_file: None,
            busy: false,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn stage_file(&mut self, file: StagedFile) {
        eprintln!("[SESSION] Staged file: {}", file.name);
        self.staged_file = Some(file);
    }

    pub fn staged_file(&self) -> Option<&StagedFile> {
        self.staged_file.as_ref()
    }

    pub fn clear_staged_file(&mut self) {
        self.staged_file = None;
    }

    /// Run one full turn. Single-flight: while a turn is in flight a new
    /// send is a no-op (history untouched, no request issued). There is no
    /// cancellation; the lock is released on every exit path.
    pub async fn send_message(
        &mut self,
        text: impl Into<String>,
        images: Option<Vec<String>>,
        events: &Sender<ChatEvent>,
    ) -> Result<(), String> {
        if self.busy {
            eprintln!("[SESSION] Turn already in flight, ignoring send");
            return Ok(());
        }
        let text = text.into();
        if text.trim().is_empty() {
            return Ok(());
        }

        self.busy = true;
        let result = self.run_turn(text, images, events).await;
        self.busy = false;

        if let Err(ref e) = result {
            let _ = events.send(ChatEvent::Error(e.clone()));
        }
        result
    }

    async fn run_turn(
        &mut self,
        text: String,
        images: Option<Vec<String>>,
        events: &Sender<ChatEvent>,
    ) -> Result<(), String> {
        let caps = detect_capabilities(&self.config.model);

        let user = match images {
            Some(imgs) if !imgs.is_empty() => {
                ChatMessage::with_images(ChatRole::User, text, imgs)
            }
            _ => ChatMessage::new(ChatRole::User, text),
        };
        self.history.push(user);

        let system_prompt = self.composed_system_prompt();
        let messages = self.history.build_api_messages(&system_prompt);

        // A transport failure here is fatal for the turn: no assistant
        // message is ever appended.
        let first = self.stream_once(messages, caps.thinking, events).await?;
        if first.raw.is_empty() {
            return Err("No response received from model".to_string());
        }

        // Tool-call scanning runs only on the completed text, and only when
        // at least one tool category is enabled. With every tool disabled a
        // tool-call-shaped response stays literal text.
        let calls = if self.config.any_tool_enabled() {
            parse_tool_calls(&first.raw)
        } else {
            Vec::new()
        };

        let content = if first.demuxed {
            first.regular.clone()
        } else {
            first.raw.clone()
        };

        if calls.is_empty() {
            self.history.push(ChatMessage::new(ChatRole::Assistant, content));
            let _ = events.send(ChatEvent::Done(first.usage));
            return Ok(());
        }

        eprintln!("[SESSION] {} tool call(s) detected", calls.len());
        // The assistant's own tool-call message lands in history before the
        // results so the synthesis request sees both.
        self.history.push(ChatMessage::new(ChatRole::Assistant, content));

        self.execute_tool_calls(&calls, events).await;

        // Synthesis pass: identical streaming contract, but failures are
        // contained to this half of the turn. Tool results stay in history.
        let _ = events.send(ChatEvent::SynthesisStarted);
        let messages = self.history.build_api_messages(&system_prompt);
        match self.stream_once(messages, caps.thinking, events).await {
            Ok(second) => {
                let content = if second.demuxed {
                    second.regular.clone()
                } else {
                    second.raw.clone()
                };
                if content.trim().is_empty() {
                    let _ = events.send(ChatEvent::Warning(
                        "Model returned an empty response after tool execution".to_string(),
                    ));
                } else {
                    self.history.push(ChatMessage::new(ChatRole::Assistant, content));
                }
                let _ = events.send(ChatEvent::Done(second.usage));
            }
            Err(e) => {
                eprintln!("[SESSION] Synthesis request failed: {}", e);
                let _ = events.send(ChatEvent::Error(format!("Synthesis failed: {}", e)));
                let _ = events.send(ChatEvent::Done(first.usage));
            }
        }
        Ok(())
    }

    /// Execute tool calls strictly in parse order. Each result (or failure)
    /// is appended to history before the next call starts, since later
    /// calls may depend on earlier results.
    async fn execute_tool_calls(&mut self, calls: &[ParsedToolCall], events: &Sender<ChatEvent>) {
        let runtime = ToolRuntime {
            http: self.http.clone(),
            staged_file: self.staged_file.clone(),
        };

        let mut analyzed_file = false;
        for call in calls {
            let id = uuid::Uuid::new_v4().to_string();
            let _ = events.send(ChatEvent::ToolStarted {
                id: id.clone(),
                name: call.name.clone(),
            });

            let mut params = Map::new();
            params.insert("query".to_string(), Value::String(call.query.clone()));
            params.insert(
                "instruction".to_string(),
                Value::String(call.instruction.clone()),
            );

            let (entry, ok) = match self.registry.execute(&runtime, &call.name, &params).await {
                Ok(result) => (format!("Tool result from {}:\n{}", call.name, result), true),
                Err(e) => {
                    eprintln!("[SESSION] Tool {} failed: {}", call.name, e);
                    (format!("Tool {} failed: {}", call.name, e), false)
                }
            };
            let _ = events.send(ChatEvent::ToolFinished {
                id,
                name: call.name.clone(),
                ok,
            });

            self.history.push(ChatMessage::new(ChatRole::System, entry));
            if call.name == "file_analysis" {
                analyzed_file = true;
            }
        }

        // Auto-clear policy: the staged file is consumed by the analysis
        // that just ran.
        if analyzed_file && self.config.auto_clear_file {
            eprintln!("[SESSION] Auto-clearing staged file after analysis");
            self.staged_file = None;
        }
    }

    fn composed_system_prompt(&self) -> String {
        let mut prompt = self.config.system_prompt.clone();
        if self.config.any_tool_enabled() {
            prompt.push_str(&self.registry.prompt_section(&self.config.enabled_tools));
        }
        prompt
    }

    /// One streaming request: send, decode line envelopes, demultiplex
    /// thinking content, emit render events, latch token counters.
    async fn stream_once(
        &self,
        messages: Vec<ChatMessage>,
        thinking_enabled: bool,
        events: &Sender<ChatEvent>,
    ) -> Result<StreamOutcome, String> {
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: true,
            options: self.config.options.clone(),
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("HTTP error! status: {}", response.status()));
        }

        let mut decoder = LineDecoder::new();
        let mut parser = ThinkingParser::new(thinking_enabled);
        let mut usage = TokenUsage::default();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| format!("Stream error: {}", e))?;
            for envelope in decoder.push(&bytes) {
                Self::fold_envelope(envelope, &mut parser, &mut usage, events)?;
            }
        }
        if let Some(envelope) = decoder.finish() {
            Self::fold_envelope(envelope, &mut parser, &mut usage, events)?;
        }

        Ok(StreamOutcome {
            raw: parser.raw().to_string(),
            regular: parser.regular().to_string(),
            demuxed: parser.is_active(),
            usage,
        })
    }

    fn fold_envelope(
        envelope: crate::protocol::StreamEnvelope,
        parser: &mut ThinkingParser,
        usage: &mut TokenUsage,
        events: &Sender<ChatEvent>,
    ) -> Result<(), String> {
        if let Some(err) = envelope.error {
            return Err(format!("Server error: {}", err));
        }

        if let Some(message) = envelope.message {
            if !message.content.is_empty() {
                let push = parser.push(&message.content);
                if push.revised {
                    let _ = events.send(ChatEvent::Revised {
                        regular: parser.regular().to_string(),
                        thinking: parser.thinking().to_string(),
                    });
                } else {
                    if !push.regular_delta.is_empty() {
                        let _ = events.send(ChatEvent::Chunk(push.regular_delta));
                    }
                    if !push.thinking_delta.is_empty() {
                        let _ = events.send(ChatEvent::Thinking(push.thinking_delta));
                    }
                }
            }
        }

        // Later counter values overwrite earlier ones; they are cumulative
        // on the wire, never summed here.
        if envelope.prompt_eval_count.is_some() {
            usage.prompt_eval_count = envelope.prompt_eval_count;
        }
        if envelope.eval_count.is_some() {
            usage.eval_count = envelope.eval_count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::tools::{ToolOutput, ToolSpec};

    fn content_line(content: &str) -> String {
        format!(
            r#"{{"message":{{"content":{}}},"done":false}}"#,
            serde_json::to_string(content).unwrap()
        )
    }

    fn done_line(prompt: u64, eval: u64) -> String {
        format!(
            r#"{{"done":true,"prompt_eval_count":{},"eval_count":{}}}"#,
            prompt, eval
        )
    }

    fn ndjson(lines: &[String]) -> String {
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }

    async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = match sock.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() - (pos + 4) >= content_length {
                    break;
                }
            }
        }
        buf
    }

    /// One-shot HTTP server: serves the given (status, body) responses in
    /// order, one connection each, counting hits.
    async fn spawn_server(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                hits_counter.fetch_add(1, Ordering::SeqCst);
                let _ = read_request(&mut sock).await;
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let resp = format!(
                    "HTTP/1.1 {} {}\r\ncontent-type: application/x-ndjson\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status, reason, body.len(), body
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn session_for(base_url: String) -> ChatSession {
        let mut config = ChatConfig::default();
        config.base_url = base_url;
        config.model = "llama3.2:3b".to_string();
        ChatSession::new(config)
    }

    fn echo_runner<'a>(_rt: &'a ToolRuntime, params: &'a Map<String, Value>) -> ToolOutput<'a> {
        Box::pin(async move {
            let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
            Ok(format!("echo:{}", query))
        })
    }

    fn boom_runner<'a>(_rt: &'a ToolRuntime, _params: &'a Map<String, Value>) -> ToolOutput<'a> {
        Box::pin(async move { Err("executor exploded".to_string()) })
    }

    fn test_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::empty();
        registry.register(ToolSpec {
            key: "echo",
            description: "Echo the query back.",
            parameters: &["query"],
            run: echo_runner,
        });
        registry.register(ToolSpec {
            key: "boom",
            description: "Always fails.",
            parameters: &["query"],
            run: boom_runner,
        });
        registry
    }

    #[tokio::test]
    async fn simple_turn_end_to_end() {
        let body = ndjson(&[content_line("4"), done_line(5, 1)]);
        let (url, hits) = spawn_server(vec![(200, body)]).await;

        let mut session = session_for(url);
        let (tx, rx) = channel();
        session.send_message("2+2?", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::User);
        assert_eq!(msgs[0].content, "2+2?");
        assert_eq!(msgs[1].role, ChatRole::Assistant);
        assert_eq!(msgs[1].content, "4");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let events: Vec<ChatEvent> = rx.try_iter().collect();
        assert!(matches!(&events[0], ChatEvent::Chunk(c) if c == "4"));
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Done(u)
                if u.prompt_eval_count == Some(5) && u.eval_count == Some(1)
        )));
    }

    #[tokio::test]
    async fn tool_turn_history_ordering() {
        let first = ndjson(&[
            content_line(r#"Checking. <tool>echo("hi")</tool>"#),
            done_line(10, 4),
        ]);
        let second = ndjson(&[content_line("All done."), done_line(20, 3)]);
        let (url, hits) = spawn_server(vec![(200, first), (200, second)]).await;

        let mut config = ChatConfig::default();
        config.base_url = url;
        config.model = "llama3.2:3b".to_string();
        config.enabled_tools.insert("echo".to_string());
        let mut session = ChatSession::with_registry(config, test_registry());

        let (tx, _rx) = channel();
        session.send_message("go", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        let roles: Vec<ChatRole> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::System,
                ChatRole::Assistant
            ]
        );
        assert!(msgs[1].content.contains("<tool>"));
        assert_eq!(msgs[2].content, "Tool result from echo:\necho:hi");
        assert_eq!(msgs[3].content, "All done.");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tool_failure_is_contained() {
        let first = ndjson(&[
            content_line(r#"<tool>boom("x")</tool> and <tool>echo("y")</tool>"#),
            done_line(1, 1),
        ]);
        let second = ndjson(&[content_line("recovered"), done_line(2, 2)]);
        let (url, hits) = spawn_server(vec![(200, first), (200, second)]).await;

        let mut config = ChatConfig::default();
        config.base_url = url;
        config.enabled_tools.insert("boom".to_string());
        config.enabled_tools.insert("echo".to_string());
        let mut session = ChatSession::with_registry(config, test_registry());

        let (tx, _rx) = channel();
        session.send_message("go", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        // user, assistant, system(failure), system(result), assistant
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[2].role, ChatRole::System);
        assert!(msgs[2].content.contains("boom failed"));
        assert!(msgs[2].content.contains("executor exploded"));
        assert_eq!(msgs[3].content, "Tool result from echo:\necho:y");
        assert_eq!(msgs[4].content, "recovered");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_flight_rejects_second_send() {
        let mut session = session_for("http://127.0.0.1:1".to_string());
        session.busy = true;

        let (tx, _rx) = channel();
        let result = session.send_message("hello", None, &tx).await;
        assert!(result.is_ok());
        assert_eq!(session.history().len(), 0);
        assert!(session.is_busy());
    }

    #[tokio::test]
    async fn http_error_is_fatal_without_assistant_append() {
        let (url, _hits) = spawn_server(vec![(500, String::new())]).await;
        let mut session = session_for(url);

        let (tx, rx) = channel();
        let err = session.send_message("hi", None, &tx).await.unwrap_err();
        assert!(err.contains("500"));

        // Failed assistant turn never appended; user message stays.
        let msgs = session.history().messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, ChatRole::User);
        assert!(!session.is_busy());

        let events: Vec<ChatEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, ChatEvent::Error(_))));
    }

    #[tokio::test]
    async fn empty_stream_is_an_error_for_the_primary_turn() {
        let body = ndjson(&[done_line(0, 0)]);
        let (url, _hits) = spawn_server(vec![(200, body)]).await;
        let mut session = session_for(url);

        let (tx, _rx) = channel();
        let err = session.send_message("hi", None, &tx).await.unwrap_err();
        assert!(err.contains("No response"));
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn thinking_content_is_demultiplexed_for_capable_models() {
        let body = ndjson(&[
            content_line("<think>pla"),
            content_line("n</think>"),
            content_line("4"),
            done_line(5, 9),
        ]);
        let (url, _hits) = spawn_server(vec![(200, body)]).await;

        let mut session = session_for(url);
        session.config.model = "deepseek-r1:7b".to_string();

        let (tx, rx) = channel();
        session.send_message("2+2?", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        assert_eq!(msgs[1].content, "4");

        let events: Vec<ChatEvent> = rx.try_iter().collect();
        let saw_thinking = events.iter().any(|e| match e {
            ChatEvent::Thinking(t) => t.contains("pla"),
            ChatEvent::Revised { thinking, .. } => thinking.contains("plan"),
            _ => false,
        });
        assert!(saw_thinking);
    }

    #[tokio::test]
    async fn late_marker_arms_demux_for_non_thinking_models() {
        let body = ndjson(&[
            content_line("lead "),
            content_line("<think>hidden</think>tail"),
            done_line(1, 1),
        ]);
        let (url, _hits) = spawn_server(vec![(200, body)]).await;

        let mut session = session_for(url);
        let (tx, rx) = channel();
        session.send_message("q", None, &tx).await.unwrap();

        assert_eq!(session.history().messages()[1].content, "lead tail");
        let events: Vec<ChatEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Revised { thinking, .. } if thinking == "hidden"
        )));
    }

    #[tokio::test]
    async fn tool_syntax_stays_literal_when_no_tool_enabled() {
        let body = ndjson(&[
            content_line(r#"Try <tool>echo("hi")</tool>"#),
            done_line(1, 1),
        ]);
        let (url, hits) = spawn_server(vec![(200, body)]).await;

        let mut session = ChatSession::with_registry(session_for(url).config, test_registry());
        let (tx, _rx) = channel();
        session.send_message("go", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].content.contains("<tool>echo"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn synthesis_failure_keeps_tool_results() {
        let first = ndjson(&[content_line(r#"<tool>echo("z")</tool>"#), done_line(1, 1)]);
        let (url, hits) = spawn_server(vec![(200, first), (500, String::new())]).await;

        let mut config = ChatConfig::default();
        config.base_url = url;
        config.enabled_tools.insert("echo".to_string());
        let mut session = ChatSession::with_registry(config, test_registry());

        let (tx, rx) = channel();
        // Synthesis failure is contained: the turn itself still succeeds.
        session.send_message("go", None, &tx).await.unwrap();

        let msgs = session.history().messages();
        let roles: Vec<ChatRole> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::System]
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let events: Vec<ChatEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Error(msg) if msg.contains("Synthesis")
        )));
    }

    #[tokio::test]
    async fn token_counters_latch_latest_values() {
        let body = ndjson(&[
            r#"{"message":{"content":"a"},"done":false,"prompt_eval_count":3}"#.to_string(),
            content_line("b"),
            done_line(7, 2),
        ]);
        let (url, _hits) = spawn_server(vec![(200, body)]).await;

        let mut session = session_for(url);
        let (tx, rx) = channel();
        session.send_message("q", None, &tx).await.unwrap();

        let events: Vec<ChatEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Done(u)
                if u.prompt_eval_count == Some(7) && u.eval_count == Some(2)
        )));
    }

    #[tokio::test]
    async fn auto_clear_drops_staged_file_after_analysis() {
        let first = ndjson(&[
            content_line(r#"<tool>file_analysis("summarize")</tool>"#),
            done_line(1, 1),
        ]);
        let second = ndjson(&[content_line("summary"), done_line(1, 1)]);
        let (url, _hits) = spawn_server(vec![(200, first), (200, second)]).await;

        let mut config = ChatConfig::default();
        config.base_url = url;
        config.enabled_tools.insert("file_analysis".to_string());
        config.auto_clear_file = true;
        let mut session = ChatSession::new(config);
        session.stage_file(StagedFile::new("notes.txt", "hello there"));

        let (tx, _rx) = channel();
        session.send_message("analyze it", None, &tx).await.unwrap();

        assert!(session.staged_file().is_none());
        let msgs = session.history().messages();
        assert!(msgs[2].content.contains("Lines: 1"));
    }
}
