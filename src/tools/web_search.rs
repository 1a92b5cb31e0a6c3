//! Web search tool: scrape the DuckDuckGo HTML endpoint, fall back to the
//! Wikipedia opensearch JSON API when the primary yields fewer than two
//! results, and merge the two with per-result source tags.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{ToolOutput, ToolRuntime};

const PRIMARY_URL: &str = "https://html.duckduckgo.com/html/";
const FALLBACK_URL: &str = "https://en.wikipedia.org/w/api.php";
const MAX_RESULTS_PER_PROVIDER: usize = 5;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
    pub source: String,
}

/// Structured payload returned as the tool result text. Errors use the same
/// shape with `error` set and a human-readable `message`.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub timestamp: String,
    pub results: Vec<SearchResult>,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn run<'a>(runtime: &'a ToolRuntime, params: &'a Map<String, Value>) -> ToolOutput<'a> {
    Box::pin(async move {
        let query = params
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        if query.is_empty() {
            return Err("web_search requires a non-empty query".to_string());
        }
        let response = search(runtime, &query).await;
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    })
}

async fn search(runtime: &ToolRuntime, query: &str) -> SearchResponse {
    let mut results = Vec::new();
    let mut failures = Vec::new();

    match fetch_primary(runtime, query).await {
        Ok(mut primary) => {
            eprintln!("[SEARCH] Primary provider returned {} results", primary.len());
            results.append(&mut primary);
        }
        Err(e) => {
            eprintln!("[SEARCH] Primary provider failed: {}", e);
            failures.push(format!("primary: {}", e));
        }
    }

    // The fallback also fills in when the primary comes back thin, not only
    // when it fails outright.
    if results.len() < 2 {
        match fetch_fallback(runtime, query).await {
            Ok(mut fallback) => {
                eprintln!("[SEARCH] Fallback provider returned {} results", fallback.len());
                results.append(&mut fallback);
            }
            Err(e) => {
                eprintln!("[SEARCH] Fallback provider failed: {}", e);
                failures.push(format!("fallback: {}", e));
            }
        }
    }

    if results.is_empty() {
        let message = if failures.is_empty() {
            format!("No results found for \"{}\"", query)
        } else {
            format!("Search failed: {}", failures.join("; "))
        };
        return SearchResponse {
            query: query.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            results: Vec::new(),
            error: true,
            message: Some(message),
        };
    }

    SearchResponse {
        query: query.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        results,
        error: false,
        message: None,
    }
}

async fn fetch_primary(runtime: &ToolRuntime, query: &str) -> Result<Vec<SearchResult>, String> {
    let response = runtime
        .http
        .get(PRIMARY_URL)
        .query(&[("q", query)])
        .header("User-Agent", "Mozilla/5.0 (compatible; ollachat)")
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("provider returned {}", response.status()));
    }

    let html = response.text().await.map_err(|e| e.to_string())?;
    Ok(parse_result_page(&html))
}

lazy_static! {
    static ref RESULT_LINK: Regex =
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap();
    static ref RESULT_SNIPPET: Regex =
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#).unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
}

/// Pull result blocks out of the provider's HTML page. Scraping is
/// best-effort: a layout change degrades to zero results and the fallback
/// provider takes over.
fn parse_result_page(html: &str) -> Vec<SearchResult> {
    let snippets: Vec<String> = RESULT_SNIPPET
        .captures_iter(html)
        .map(|cap| clean_html(&cap[1]))
        .collect();

    RESULT_LINK
        .captures_iter(html)
        .take(MAX_RESULTS_PER_PROVIDER)
        .enumerate()
        .map(|(i, cap)| SearchResult {
            title: clean_html(&cap[2]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
            url: cap[1].to_string(),
            source: "duckduckgo".to_string(),
        })
        .filter(|r| !r.title.is_empty())
        .collect()
}

async fn fetch_fallback(runtime: &ToolRuntime, query: &str) -> Result<Vec<SearchResult>, String> {
    let response = runtime
        .http
        .get(FALLBACK_URL)
        .query(&[
            ("action", "opensearch"),
            ("search", query),
            ("limit", "5"),
            ("format", "json"),
        ])
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("provider returned {}", response.status()));
    }

    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    Ok(parse_opensearch(&body))
}

/// Opensearch replies with four parallel arrays: query, titles, snippets,
/// urls, ranked by relevance.
fn parse_opensearch(body: &Value) -> Vec<SearchResult> {
    let titles = body.get(1).and_then(|v| v.as_array());
    let snippets = body.get(2).and_then(|v| v.as_array());
    let urls = body.get(3).and_then(|v| v.as_array());

    let (Some(titles), Some(urls)) = (titles, urls) else {
        return Vec::new();
    };

    titles
        .iter()
        .zip(urls.iter())
        .enumerate()
        .take(MAX_RESULTS_PER_PROVIDER)
        .filter_map(|(i, (title, url))| {
            let title = title.as_str()?.to_string();
            let url = url.as_str()?.to_string();
            let snippet = snippets
                .and_then(|s| s.get(i))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(SearchResult {
                title,
                snippet,
                url,
                source: "wikipedia".to_string(),
            })
        })
        .collect()
}

fn clean_html(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, "");
    stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}
