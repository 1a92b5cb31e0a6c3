//! Built-in host-side tools the model can invoke mid-conversation.
//!
//! Every tool follows the same executor contract: a parameter map in, a
//! result string out, failure as a string error. The dispatcher looks tools
//! up by key only and never special-cases names, so executor failures stay
//! data, not control flow.

pub mod file_analysis;
pub mod web_search;

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

/// The one externally-staged file `file_analysis` operates on. Content is
/// already text; PDF extraction happens outside the core before staging.
#[derive(Clone, Debug)]
pub struct StagedFile {
    pub name: String,
    pub extension: String,
    pub content: String,
}

impl StagedFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        Self {
            name,
            extension,
            content: content.into(),
        }
    }
}

/// Execution context handed to every tool runner.
pub struct ToolRuntime {
    pub http: reqwest::Client,
    pub staged_file: Option<StagedFile>,
}

pub type ToolOutput<'a> = BoxFuture<'a, Result<String, String>>;
pub type ToolRunner =
    for<'a> fn(&'a ToolRuntime, &'a Map<String, Value>) -> ToolOutput<'a>;

pub struct ToolSpec {
    pub key: &'static str,
    pub description: &'static str,
    /// Declared parameter shape; which keys the runner actually reads.
    pub parameters: &'static [&'static str],
    pub run: ToolRunner,
}

pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    /// The fixed built-in set.
    pub fn builtin() -> Self {
        Self {
            tools: vec![
                ToolSpec {
                    key: "web_search",
                    description: "Search the web for current information. \
                        Returns titles, snippets and URLs of matching pages.",
                    parameters: &["query"],
                    run: web_search::run,
                },
                ToolSpec {
                    key: "file_analysis",
                    description: "Analyze the file the user has uploaded. \
                        Produces structure, statistics and the file content.",
                    parameters: &["instruction"],
                    run: file_analysis::run,
                },
            ],
        }
    }

    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.push(spec);
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Dispatch by key. Unknown names and runner failures both come back as
    /// `Err(String)`; the session turns either into conversation content so
    /// the model can react on the next turn.
    pub async fn execute(
        &self,
        runtime: &ToolRuntime,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<String, String> {
        let Some(spec) = self.tools.iter().find(|t| t.key == name) else {
            return Err(format!("Unknown tool: {}", name));
        };
        eprintln!("[TOOL] Executing {} with {} params", name, params.len());
        (spec.run)(runtime, params).await
    }

    /// System-prompt section advertising the enabled tools and the inline
    /// invocation syntax.
    pub fn prompt_section(&self, enabled: &BTreeSet<String>) -> String {
        let active: Vec<&ToolSpec> = self
            .tools
            .iter()
            .filter(|t| enabled.contains(t.key))
            .collect();
        if active.is_empty() {
            return String::new();
        }

        let mut out = String::from(
            "\n\nYou have access to the following tools. To use one, include \
             a call in your response using exactly this syntax: \
             <tool>tool_name(\"value\")</tool>\n",
        );
        for spec in active {
            out.push_str(&format!(
                "- {}({}): {}\n",
                spec.key,
                spec.parameters.join(", "),
                spec.description
            ));
        }
        out.push_str(
            "Tool results will be provided to you in a follow-up message; \
             use them to compose your final answer.",
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with(key: &str, value: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), Value::String(value.to_string()));
        map
    }

    fn runtime() -> ToolRuntime {
        ToolRuntime {
            http: reqwest::Client::new(),
            staged_file: None,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_string_error() {
        let registry = ToolRegistry::builtin();
        let err = registry
            .execute(&runtime(), "rm_rf", &Map::new())
            .await
            .unwrap_err();
        assert!(err.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn file_analysis_without_staged_file_fails_descriptively() {
        let registry = ToolRegistry::builtin();
        let err = registry
            .execute(&runtime(), "file_analysis", &params_with("instruction", "summarize"))
            .await
            .unwrap_err();
        assert!(err.contains("No file"));
    }

    #[test]
    fn staged_file_extension_is_lowercased() {
        let file = StagedFile::new("Report.JSON", "{}");
        assert_eq!(file.extension, "json");
        let bare = StagedFile::new("Makefile", "all:");
        assert_eq!(bare.extension, "");
    }

    #[test]
    fn prompt_section_lists_only_enabled_tools() {
        let registry = ToolRegistry::builtin();
        let mut enabled = BTreeSet::new();
        enabled.insert("web_search".to_string());

        let prompt = registry.prompt_section(&enabled);
        assert!(prompt.contains("web_search"));
        assert!(!prompt.contains("file_analysis"));

        assert!(registry.prompt_section(&BTreeSet::new()).is_empty());
    }
}
