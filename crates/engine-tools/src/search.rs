//! Search backend abstraction.
//!
//! The engine talks to exactly one external search provider per deployment,
//! selected at startup by `SEARCH_PROVIDER`. Both backends normalise their
//! provider-specific response shape into `SearchHit`, so everything above
//! this module (tools, content extraction, relevance filtering) is backend
//! agnostic.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// A single normalised search result.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchHit {
    pub title: Option<String>,
    pub url: String,
    pub snippet: Option<String>,
    /// Provider-supplied page content, when the provider returns it directly.
    /// Some providers fold snippet and content into the same field — see
    /// DESIGN.md open question (a).
    pub content: Option<String>,
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub num: u32,
    pub days: Option<u32>,
    /// "basic" or "advanced" — providers that support a depth knob use it to
    /// trade off latency for result richness.
    pub depth: String,
}

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchHit>, SearchError>;
}

/// Tavily search API (https://tavily.com).
pub struct TavilyBackend {
    client: reqwest::Client,
    api_key: String,
}

impl TavilyBackend {
    pub fn new(api_key: String) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, api_key })
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    title: Option<String>,
    url: String,
    content: Option<String>,
    published_date: Option<String>,
}

#[async_trait::async_trait]
impl SearchBackend for TavilyBackend {
    async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchHit>, SearchError> {
        let mut body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": options.num.clamp(1, 10),
            "search_depth": if options.depth.is_empty() { "advanced" } else { options.depth.as_str() },
            "include_answer": false,
        });
        if let Some(days) = options.days {
            body["days"] = serde_json::json!(days);
        }

        debug!("Tavily search: {}", query);
        let response = self
            .client
            .post("https://api.tavily.com/search")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: TavilyResponse = response.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content.clone(),
                content: r.content,
                published_date: r.published_date,
            })
            .collect())
    }
}

/// SerpApi (https://serpapi.com), Google-results-shaped.
pub struct SerpApiBackend {
    client: reqwest::Client,
    api_key: String,
}

impl SerpApiBackend {
    pub fn new(api_key: String) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, api_key })
    }
}

#[derive(Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<SerpApiResult>,
}

#[derive(Deserialize)]
struct SerpApiResult {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
    date: Option<String>,
}

#[async_trait::async_trait]
impl SearchBackend for SerpApiBackend {
    async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchHit>, SearchError> {
        let mut params = vec![
            ("engine".to_string(), "google".to_string()),
            ("q".to_string(), query.to_string()),
            ("api_key".to_string(), self.api_key.clone()),
            ("num".to_string(), options.num.clamp(1, 10).to_string()),
        ];
        if let Some(days) = options.days {
            // SerpApi's relative-time filter; qdr:d<days> roughly maps to a day window.
            params.push(("tbs".to_string(), format!("qdr:d{}", days)));
        }

        debug!("SerpApi search: {}", query);
        let response = self
            .client
            .get("https://serpapi.com/search")
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let parsed: SerpApiResponse = response.json().await?;
        Ok(parsed
            .organic_results
            .into_iter()
            .filter_map(|r| {
                let url = r.link?;
                Some(SearchHit {
                    title: r.title,
                    url,
                    snippet: r.snippet,
                    content: None,
                    published_date: r.date,
                })
            })
            .collect())
    }
}

/// Builds the configured backend from env, matching spec §6's `SEARCH_PROVIDER` switch.
pub fn backend_from_env() -> anyhow::Result<std::sync::Arc<dyn SearchBackend>> {
    let provider = std::env::var("SEARCH_PROVIDER").unwrap_or_else(|_| "tavily".to_string());
    match provider.as_str() {
        "tavily" => {
            let key = std::env::var("TAVILY_API_KEY")
                .map_err(|_| anyhow::anyhow!("TAVILY_API_KEY must be set when SEARCH_PROVIDER=tavily"))?;
            Ok(std::sync::Arc::new(TavilyBackend::new(key)?))
        }
        "serpapi" => {
            let key = std::env::var("SERPAPI_API_KEY")
                .map_err(|_| anyhow::anyhow!("SERPAPI_API_KEY must be set when SEARCH_PROVIDER=serpapi"))?;
            Ok(std::sync::Arc::new(SerpApiBackend::new(key)?))
        }
        other => {
            warn!("Unknown SEARCH_PROVIDER '{}', defaulting to tavily", other);
            let key = std::env::var("TAVILY_API_KEY")
                .map_err(|_| anyhow::anyhow!("TAVILY_API_KEY must be set"))?;
            Ok(std::sync::Arc::new(TavilyBackend::new(key)?))
        }
    }
}
