use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::protocol::GenerationOptions;

/// Settings surface consumed by the session core. Owned by the UI layer;
/// the session only reads it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub options: GenerationOptions,
    /// Tool keys enabled for this session; empty means tool-call-shaped text
    /// stays literal and is never executed.
    #[serde(default)]
    pub enabled_tools: BTreeSet<String>,
    /// Drop the staged file after a file_analysis call consumed it.
    #[serde(default)]
    pub auto_clear_file: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            system_prompt: String::new(),
            options: GenerationOptions::default(),
            enabled_tools: BTreeSet::new(),
            auto_clear_file: false,
        }
    }
}

impl ChatConfig {
    pub fn tool_enabled(&self, key: &str) -> bool {
        self.enabled_tools.contains(key)
    }

    pub fn any_tool_enabled(&self) -> bool {
        !self.enabled_tools.is_empty()
    }
}

fn default_base_url() -> String {
    std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

fn default_model() -> String {
    crate::models::DEFAULT_MODEL.to_string()
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("com", "zaguan", "ollachat") else {
        return Path::new("ollachat.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

pub fn load_config(path: &Path) -> ChatConfig {
    let Ok(bytes) = fs::read(path) else {
        return ChatConfig::default();
    };
    serde_json::from_slice::<ChatConfig>(&bytes).unwrap_or_default()
}

pub fn save_config(path: &Path, cfg: &ChatConfig) -> Result<(), String> {
    let json = serde_json::to_vec_pretty(cfg).map_err(|e| e.to_string())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(path, json).map_err(|e| e.to_string())
}
