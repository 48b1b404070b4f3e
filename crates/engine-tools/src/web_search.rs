//! Web search tool, backed by the configured `SearchBackend`.

use crate::extract::fetch_page_content;
use crate::search::{SearchBackend, SearchError, SearchOptions};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WebSearchError {
    #[error("Search failed: {0}")]
    SearchFailed(String),
}

impl From<SearchError> for WebSearchError {
    fn from(e: SearchError) -> Self {
        WebSearchError::SearchFailed(e.to_string())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    #[schemars(description = "The search query to look up on the web, at least 2 characters")]
    pub query: String,
    #[schemars(description = "Number of results to return, 1-10, default 3")]
    pub num: Option<u32>,
    #[schemars(description = "Whether to fetch and include page content, default true")]
    pub include_content: Option<bool>,
    #[schemars(description = "Restrict results to the last N days, 1-365")]
    pub days: Option<u32>,
    #[schemars(description = "Search depth: \"basic\" or \"advanced\", default advanced")]
    pub depth: Option<String>,
}

#[derive(Clone)]
pub struct WebSearch {
    backend: Arc<dyn SearchBackend>,
    http: reqwest::Client,
}

impl WebSearch {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
        }
    }

    /// Core search implementation, reused directly by `latest_finder`.
    pub async fn run(
        &self,
        args: &WebSearchArgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<serde_json::Value>, WebSearchError> {
        let num = args.num.unwrap_or(3).clamp(1, 10);
        let include_content = args.include_content.unwrap_or(true);
        let depth = args.depth.clone().unwrap_or_else(|| "advanced".to_string());

        let options = SearchOptions {
            num,
            days: args.days.map(|d| d.clamp(1, 365)),
            depth,
        };

        let mut hits = self.backend.search(&args.query, options).await?;

        if include_content {
            let mut fetched = std::collections::HashMap::new();
            let urls: Vec<String> = hits.iter().take(8).map(|h| h.url.clone()).collect();
            let mut handles = Vec::new();
            for url in urls {
                let http = self.http.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    let content = fetch_page_content(&http, &url, &cancel).await;
                    (url, content)
                }));
            }
            for handle in handles {
                if let Ok((url, Some(content))) = handle.await {
                    fetched.insert(url, content);
                }
            }

            for hit in hits.iter_mut() {
                if let Some(content) = fetched.remove(&hit.url) {
                    if hit.snippet.is_none() {
                        hit.snippet = Some(content.clone());
                    }
                    hit.content = Some(content);
                }
            }
        }

        debug!("web_search '{}' returned {} hits", args.query, hits.len());

        Ok(hits
            .into_iter()
            .map(|h| {
                serde_json::json!({
                    "title": h.title,
                    "url": h.url,
                    "snippet": h.snippet,
                    "content": h.content,
                })
            })
            .collect())
    }
}

impl Tool for WebSearch {
    const NAME: &'static str = "web_search";
    type Error = WebSearchError;
    type Args = WebSearchArgs;
    type Output = String;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".to_string(),
            description: "Search the web for current information, news, facts, or any topic. \
                Use this when you need up-to-date information or don't know something."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query, at least 2 characters" },
                    "num": { "type": "integer", "description": "Number of results, 1-10, default 3" },
                    "include_content": { "type": "boolean", "description": "Fetch page content, default true" },
                    "days": { "type": "integer", "description": "Restrict to the last N days" },
                    "depth": { "type": "string", "enum": ["basic", "advanced"] }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let results = self.run(&args, &CancellationToken::new()).await?;
        Ok(serde_json::Value::Array(results).to_string())
    }
}
