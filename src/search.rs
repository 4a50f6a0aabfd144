use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::{SearchProviderKind, WebSearchConfig};
use crate::core::errors::RagError;

const GOOGLE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const DUCKDUCKGO_ENDPOINT: &str = "https://api.duckduckgo.com/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Position in the provider's ranking, 0 is best
    pub rank: usize,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    fn name(&self) -> &str;

    /// At most `max_results` results in provider order.
    ///
    /// Transport failures and non-success responses are
    /// [`RagError::SearchUnavailable`].
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, RagError>;
}

/// Builds the configured provider, or `None` when web search is disabled.
pub fn build_web_search(config: &WebSearchConfig) -> Result<Option<Arc<dyn WebSearch>>, RagError> {
    if !config.enabled {
        return Ok(None);
    }

    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(RagError::internal)?;

    let provider: Arc<dyn WebSearch> = match config.provider {
        SearchProviderKind::Google => {
            let (Some(api_key), Some(engine_id)) = (
                config.google_api_key.clone(),
                config.google_engine_id.clone(),
            ) else {
                return Err(RagError::Configuration(
                    "Google search requires google_api_key and google_engine_id".to_string(),
                ));
            };
            Arc::new(GoogleSearch::new(client, api_key, engine_id))
        }
        SearchProviderKind::Brave => {
            let Some(api_key) = config.brave_api_key.clone() else {
                return Err(RagError::Configuration(
                    "Brave search requires brave_api_key".to_string(),
                ));
            };
            Arc::new(BraveSearch::new(client, api_key))
        }
        SearchProviderKind::Duckduckgo => Arc::new(DuckDuckGoSearch::new(client)),
    };

    tracing::info!("Web search provider: {}", provider.name());
    Ok(Some(provider))
}

pub struct GoogleSearch {
    client: Client,
    api_key: String,
    engine_id: String,
    endpoint: String,
}

impl GoogleSearch {
    pub fn new(client: Client, api_key: String, engine_id: String) -> Self {
        Self {
            client,
            api_key,
            engine_id,
            endpoint: GOOGLE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl WebSearch for GoogleSearch {
    fn name(&self) -> &str {
        "google"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, RagError> {
        let url = format!(
            "{}?key={}&cx={}&num={}&q={}",
            self.endpoint,
            urlencoding::encode(&self.api_key),
            urlencoding::encode(&self.engine_id),
            max_results.clamp(1, 10),
            urlencoding::encode(query)
        );
        let request = self.client.get(url);
        let payload = fetch_json(self.name(), request).await?;
        Ok(rank_results(parse_google(&payload), max_results))
    }
}

pub struct BraveSearch {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearch {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            endpoint: BRAVE_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl WebSearch for BraveSearch {
    fn name(&self) -> &str {
        "brave"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, RagError> {
        let url = format!(
            "{}?q={}&count={}",
            self.endpoint,
            urlencoding::encode(query),
            max_results.clamp(1, 20)
        );
        let request = self
            .client
            .get(url)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json");
        let payload = fetch_json(self.name(), request).await?;
        Ok(rank_results(parse_brave(&payload), max_results))
    }
}

pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: DUCKDUCKGO_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, RagError> {
        let url = format!(
            "{}?q={}&format=json&no_redirect=1&no_html=1",
            self.endpoint,
            urlencoding::encode(query)
        );
        let payload = fetch_json(self.name(), self.client.get(url)).await?;
        Ok(rank_results(parse_duckduckgo(&payload), max_results))
    }
}

async fn fetch_json(provider: &str, request: reqwest::RequestBuilder) -> Result<Value, RagError> {
    let response = request.send().await.map_err(|err| {
        RagError::SearchUnavailable(format!("{} search request failed: {}", provider, err))
    })?;

    if !response.status().is_success() {
        return Err(RagError::SearchUnavailable(format!(
            "{} search failed: {}",
            provider,
            response.status()
        )));
    }

    response.json().await.map_err(|err| {
        RagError::SearchUnavailable(format!("{} returned an unreadable body: {}", provider, err))
    })
}

/// Raw hit before ranking: (title, url, snippet).
type RawHit = (String, String, String);

fn rank_results(hits: Vec<RawHit>, max_results: usize) -> Vec<SearchResult> {
    hits.into_iter()
        .take(max_results)
        .enumerate()
        .map(|(rank, (title, url, snippet))| SearchResult {
            title,
            url,
            snippet,
            rank,
        })
        .collect()
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn parse_google(payload: &Value) -> Vec<RawHit> {
    payload
        .get("items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    (
                        str_field(item, "title"),
                        str_field(item, "link"),
                        str_field(item, "snippet"),
                    )
                })
                .filter(|(title, url, _)| !title.is_empty() && !url.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_brave(payload: &Value) -> Vec<RawHit> {
    payload
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    (
                        str_field(item, "title"),
                        str_field(item, "url"),
                        str_field(item, "description"),
                    )
                })
                .filter(|(title, url, _)| !title.is_empty() && !url.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_duckduckgo(payload: &Value) -> Vec<RawHit> {
    let mut hits = Vec::new();

    let abstract_text = str_field(payload, "AbstractText");
    let abstract_url = str_field(payload, "AbstractURL");
    if !abstract_text.is_empty() && !abstract_url.is_empty() {
        let heading = str_field(payload, "Heading");
        let title = if heading.is_empty() {
            abstract_text
                .split(" - ")
                .next()
                .unwrap_or(&abstract_text)
                .to_string()
        } else {
            heading
        };
        hits.push((title, abstract_url, abstract_text));
    }

    if let Some(items) = payload.get("Results").and_then(|v| v.as_array()) {
        extract_ddg_topics(items, &mut hits);
    }
    if let Some(items) = payload.get("RelatedTopics").and_then(|v| v.as_array()) {
        extract_ddg_topics(items, &mut hits);
    }

    hits
}

fn extract_ddg_topics(items: &[Value], hits: &mut Vec<RawHit>) {
    for item in items {
        if let Some(topics) = item.get("Topics").and_then(|v| v.as_array()) {
            extract_ddg_topics(topics, hits);
            continue;
        }
        let text = str_field(item, "Text");
        let url = str_field(item, "FirstURL");
        if text.is_empty() || url.is_empty() {
            continue;
        }
        let title = text.split(" - ").next().unwrap_or(&text).to_string();
        hits.push((title, url, text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn google_items_are_ranked_in_order_and_truncated() {
        let payload = json!({
            "items": [
                { "title": "First", "link": "https://a.example", "snippet": "a" },
                { "title": "", "link": "https://skip.example", "snippet": "no title" },
                { "title": "Second", "link": "https://b.example", "snippet": "b" },
                { "title": "Third", "link": "https://c.example", "snippet": "c" }
            ]
        });

        let results = rank_results(parse_google(&payload), 2);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://a.example");
        assert_eq!(results[0].rank, 0);
        assert_eq!(results[1].url, "https://b.example");
        assert_eq!(results[1].rank, 1);
    }

    #[test]
    fn brave_results_use_description_as_snippet() {
        let payload = json!({
            "web": { "results": [
                { "title": "Rust", "url": "https://rust-lang.org", "description": "A language" }
            ]}
        });

        let results = rank_results(parse_brave(&payload), 5);
        assert_eq!(results[0].snippet, "A language");
    }

    #[test]
    fn duckduckgo_flattens_nested_topics() {
        let payload = json!({
            "Heading": "Rust",
            "AbstractText": "Rust is a language.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
            "RelatedTopics": [
                { "Text": "Cargo - package manager", "FirstURL": "https://doc.rust-lang.org/cargo" },
                { "Name": "Group", "Topics": [
                    { "Text": "Clippy - linter", "FirstURL": "https://github.com/rust-lang/rust-clippy" }
                ]}
            ]
        });

        let results = rank_results(parse_duckduckgo(&payload), 10);

        let titles: Vec<&str> = results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust", "Cargo", "Clippy"]);
        assert_eq!(results[2].rank, 2);
    }

    #[test]
    fn missing_payload_sections_yield_no_results() {
        assert!(parse_google(&json!({})).is_empty());
        assert!(parse_brave(&json!({ "web": {} })).is_empty());
        assert!(parse_duckduckgo(&json!({ "AbstractText": "" })).is_empty());
    }

    #[test]
    fn disabled_search_builds_nothing() {
        let config = WebSearchConfig {
            enabled: false,
            ..WebSearchConfig::default()
        };
        assert!(build_web_search(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_provider_is_search_unavailable() {
        let client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let search = GoogleSearch::new(client, "key".to_string(), "cx".to_string())
            .with_endpoint("http://127.0.0.1:9/customsearch");

        let result = search.search("anything", 3).await;
        assert!(matches!(result, Err(RagError::SearchUnavailable(_))));
    }
}
