use std::time::{Duration, Instant};

use serde::Deserialize;

const CACHE_TTL: Duration = Duration::from_secs(300);
const MAX_RETRIES: u32 = 2;

/// Offered when the server lists no models at all, so the picker is never
/// empty.
pub const DEFAULT_MODEL: &str = "llama3.2:3b";

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
}

/// Per-model capability flags derived from the model name, not from
/// configuration data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub thinking: bool,
    pub vision: bool,
}

pub fn detect_capabilities(model_name: &str) -> ModelCapabilities {
    let lower = model_name.to_lowercase();
    ModelCapabilities {
        thinking: lower.contains("deepseek")
            || lower.contains("qwq")
            || lower.contains("r1")
            || lower.contains("minimax")
            || lower.contains("kimi"),
        vision: lower.contains("llava")
            || lower.contains("moondream")
            || lower.contains("bakllava")
            || lower.contains("vision"),
    }
}

/// Model listing client with a short-lived cache and bounded retry.
///
/// One registry per session; the expired cache is still served when the
/// server stops answering so the picker does not go blank mid-session.
pub struct ModelRegistry {
    http: reqwest::Client,
    cache: Option<(Vec<ModelInfo>, Instant)>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: None,
        }
    }

    pub async fn list_models(&mut self, base_url: &str) -> Vec<ModelInfo> {
        if let Some((models, fetched)) = &self.cache {
            if fetched.elapsed() < CACHE_TTL {
                return Self::or_default(models.clone());
            }
        }

        let mut retry = 0;
        loop {
            match self.fetch(base_url).await {
                Ok(models) => {
                    eprintln!("[MODELS] Fetched {} models from {}", models.len(), base_url);
                    self.cache = Some((models.clone(), Instant::now()));
                    return Self::or_default(models);
                }
                Err(e) => {
                    retry += 1;
                    if retry > MAX_RETRIES {
                        eprintln!(
                            "[MODELS] Failed to fetch models from {} after {} retries: {}",
                            base_url, MAX_RETRIES, e
                        );
                        break;
                    }
                    let delay = Duration::from_millis(500 * (1 << (retry - 1)));
                    eprintln!("[MODELS] Fetch failed ({}): {}. Retrying in {:?}", retry, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if let Some((models, _)) = &self.cache {
            eprintln!("[MODELS] Serving expired cache as fallback");
            return Self::or_default(models.clone());
        }
        Self::or_default(Vec::new())
    }

    fn or_default(models: Vec<ModelInfo>) -> Vec<ModelInfo> {
        if models.is_empty() {
            eprintln!("[MODELS] No models listed, offering {}", DEFAULT_MODEL);
            return vec![ModelInfo {
                name: DEFAULT_MODEL.to_string(),
            }];
        }
        models
    }

    async fn fetch(&self, base_url: &str) -> Result<Vec<ModelInfo>, String> {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }

        let tags: TagsResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo { name: m.name })
            .collect())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Connectivity probe against `/api/tags`; any non-2xx or network failure
/// means the disconnected state.
pub async fn test_connection(base_url: &str) -> Result<(), String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("Failed to connect to server: {}", e))?;

    if response.status().is_success() {
        Ok(())
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(format!("Server returned {}: {}", status, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_models_by_name() {
        assert!(detect_capabilities("deepseek-r1:7b").thinking);
        assert!(detect_capabilities("qwq:32b").thinking);
        assert!(!detect_capabilities("llama3.2:3b").thinking);
    }

    #[test]
    fn vision_models_by_name() {
        assert!(detect_capabilities("llava:13b").vision);
        assert!(detect_capabilities("llama3.2-vision:11b").vision);
        assert!(!detect_capabilities("llama3.2:3b").vision);
    }

    #[test]
    fn tags_response_tolerates_empty_body() {
        let tags: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(tags.models.is_empty());
    }

    #[test]
    fn empty_listing_falls_back_to_default_model() {
        let models = ModelRegistry::or_default(Vec::new());
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, DEFAULT_MODEL);
    }

    #[test]
    fn non_empty_listing_is_untouched() {
        let listed = vec![ModelInfo {
            name: "mistral:7b".to_string(),
        }];
        assert_eq!(ModelRegistry::or_default(listed.clone()), listed);
    }
}
