//! Extracts tool invocations from finished model output.
//!
//! The model is a free-text producer, so the same invocation shows up in
//! several redundant surface syntaxes. Parsing runs only once the stream has
//! fully completed, never mid-stream.

use lazy_static::lazy_static;
use regex::Regex;

/// A structured tool directive lifted out of assistant text.
///
/// `query` and `instruction` carry the same value for the inline call
/// syntaxes so every tool can read whichever key it declares.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub query: String,
    pub instruction: String,
}

impl ParsedToolCall {
    fn inline(name: &str, value: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            query: value.to_string(),
            instruction: value.to_string(),
        }
    }
}

lazy_static! {
    // Precedence 1: double-quoted argument.
    static ref TOOL_DOUBLE_QUOTED: Regex =
        Regex::new(r#"<tool>\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*"([^"]*)"\s*\)\s*</tool>"#).unwrap();
    // Precedence 2: single-quoted argument.
    static ref TOOL_SINGLE_QUOTED: Regex =
        Regex::new(r#"<tool>\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*'([^']*)'\s*\)\s*</tool>"#).unwrap();
    // Precedence 3: unquoted argument; matches a superset of 1 and 2, so it
    // relies on dedup against the earlier passes.
    static ref TOOL_UNQUOTED: Regex =
        Regex::new(r#"<tool>\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*</tool>"#).unwrap();
    // Precedence 4: fenced block tagged `tool` holding a JSON object.
    static ref TOOL_FENCED_JSON: Regex =
        Regex::new(r"(?s)```tool\s*(\{.*?\})\s*```").unwrap();
}

/// Scan a complete response for tool invocations across all four syntaxes.
///
/// Matches are returned pass by pass (double-quoted, single-quoted,
/// unquoted, fenced JSON), each pass in text order. The inline passes dedup
/// against each other on lower-cased name plus extracted value; fenced JSON
/// entries are an independent pass and never dedup against the inline ones.
pub fn parse_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut calls: Vec<ParsedToolCall> = Vec::new();
    let mut seen: Vec<(String, String)> = Vec::new();

    for re in [&*TOOL_DOUBLE_QUOTED, &*TOOL_SINGLE_QUOTED, &*TOOL_UNQUOTED] {
        for cap in re.captures_iter(text) {
            let name = cap[1].to_lowercase();
            let value = strip_surrounding_quotes(cap[2].trim()).to_string();
            let key = (name.clone(), value.clone());
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            calls.push(ParsedToolCall::inline(&name, &value));
        }
    }

    for cap in TOOL_FENCED_JSON.captures_iter(text) {
        match serde_json::from_str::<serde_json::Value>(&cap[1]) {
            Ok(obj) => {
                let Some(name) = obj.get("name").and_then(|v| v.as_str()) else {
                    eprintln!("[TOOL PARSE] Fenced tool block missing name field, skipping");
                    continue;
                };
                let query = obj.get("query").and_then(|v| v.as_str()).map(str::to_string);
                let instruction = obj
                    .get("instruction")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                // Mirror whichever of the two keys is present into the other.
                let (query, instruction) = match (query, instruction) {
                    (Some(q), Some(i)) => (q, i),
                    (Some(q), None) => (q.clone(), q),
                    (None, Some(i)) => (i.clone(), i),
                    (None, None) => (String::new(), String::new()),
                };
                calls.push(ParsedToolCall {
                    name: name.to_lowercase(),
                    query,
                    instruction,
                });
            }
            Err(e) => {
                eprintln!("[TOOL PARSE] Malformed JSON in fenced tool block, skipping: {}", e);
            }
        }
    }

    calls
}

fn strip_surrounding_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
