//! Finds the most recently published, corroborated fact date for a query.
//!
//! Issues recency-biased query rewrites, shrinks the search window toward the
//! gap since the current best date, and stops once two distinct credible
//! domains agree on a date within 48 hours of each other.

use crate::extract::fetch_page_content;
use crate::search::{SearchBackend, SearchOptions};
use crate::web_search::WebSearchError;
use chrono::{DateTime, Utc};
use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_ITERATIONS: u32 = 5;
const CREDIBLE_AUTHORITY_THRESHOLD: u32 = 65;
const AGREEMENT_WINDOW_HOURS: i64 = 48;
const MIN_DISTINCT_SOURCES: usize = 2;

#[derive(Debug, Error)]
pub enum LatestFinderError {
    #[error("Search failed: {0}")]
    SearchFailed(String),
}

impl From<WebSearchError> for LatestFinderError {
    fn from(e: WebSearchError) -> Self {
        LatestFinderError::SearchFailed(e.to_string())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LatestFinderArgs {
    #[schemars(description = "The topic or entity to find the latest date/event for")]
    pub query: String,
}

#[derive(Clone)]
pub struct LatestFinder {
    backend: Arc<dyn SearchBackend>,
    http: reqwest::Client,
}

/// Extracts the lowercased host from a URL, used both for authority scoring
/// and for counting *distinct* credible domains rather than distinct URLs.
fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_lowercase()
}

/// Mirrors the authority table in the citation gate; duplicated deliberately
/// (the two components live in different crates and neither should depend on
/// the other to judge host trust).
fn authority_score(url: &str) -> u32 {
    let host = host_of(url);

    if host.contains("sec.gov") {
        100
    } else if host.contains("wikidata.org") {
        90
    } else if host.contains("wikipedia.org") {
        85
    } else if host.ends_with(".gov") {
        80
    } else if host.ends_with(".edu") {
        75
    } else if ["bloomberg.com", "reuters.com", "ft.com", "nytimes.com", "wsj.com"]
        .iter()
        .any(|d| host.ends_with(d))
    {
        72
    } else if host.starts_with("www.") {
        65
    } else if host.is_empty() {
        0
    } else {
        50
    }
}

fn query_rewrites(query: &str) -> Vec<String> {
    vec![
        format!("{} latest news", query),
        format!("{} recent update", query),
        format!("{} announcement this week", query),
    ]
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc())
        })
}

impl LatestFinder {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<serde_json::Value, LatestFinderError> {
        let rewrites = query_rewrites(query);
        let mut best_date: Option<DateTime<Utc>> = None;
        let mut sources: Vec<(String, DateTime<Utc>, u32)> = Vec::new();
        let mut total_collected = 0usize;
        let mut iterations = 0u32;
        let mut days_window: u32 = 365;
        let mut prev_newest: Option<DateTime<Utc>> = None;

        for (i, rewrite) in rewrites.iter().cycle().take(MAX_ITERATIONS as usize).enumerate() {
            iterations = (i + 1) as u32;

            let options = SearchOptions {
                num: 10,
                days: Some(days_window),
                depth: "advanced".to_string(),
            };
            let hits = self
                .backend
                .search(rewrite, options)
                .await
                .map_err(|e| LatestFinderError::SearchFailed(e.to_string()))?;
            total_collected += hits.len();

            for hit in hits.iter().take(10) {
                if cancel.is_cancelled() {
                    break;
                }

                let published = if let Some(d) = &hit.published_date {
                    parse_date(d)
                } else if let Some(html) = fetch_page_content(&self.http, &hit.url, cancel).await {
                    crate::extract::extract_published_date(&html).and_then(|d| parse_date(&d))
                } else {
                    None
                };

                if let Some(date) = published {
                    let score = authority_score(&hit.url);
                    sources.push((hit.url.clone(), date, score));
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let seen_domains: HashSet<String> = sources
                .iter()
                .filter(|(_, _, score)| *score >= CREDIBLE_AUTHORITY_THRESHOLD)
                .map(|(url, _, _)| host_of(url))
                .collect();

            if let Some(newest) = sources.iter().map(|(_, d, _)| *d).max() {
                let agreeing: Vec<_> = sources
                    .iter()
                    .filter(|(_, d, score)| {
                        *score >= CREDIBLE_AUTHORITY_THRESHOLD
                            && (newest - *d).num_hours().abs() <= AGREEMENT_WINDOW_HOURS
                    })
                    .collect();

                let distinct_domains: HashSet<String> =
                    agreeing.iter().map(|(url, _, _)| host_of(url)).collect();

                if distinct_domains.len() >= MIN_DISTINCT_SOURCES || seen_domains.len() >= MIN_DISTINCT_SOURCES {
                    best_date = Some(newest);
                    break;
                }

                // No new, more-recent date surfaced since the prior iteration:
                // further rewrites are unlikely to make progress either.
                if prev_newest == Some(newest) {
                    best_date = Some(newest);
                    break;
                }
                prev_newest = Some(newest);

                let gap = Utc::now().signed_duration_since(newest).num_days().max(1) as u32;
                days_window = gap.min(days_window).max(1);
            }

            debug!(
                "latest_finder iteration {} for '{}': {} sources so far",
                iterations,
                query,
                sources.len()
            );
        }

        if best_date.is_none() {
            best_date = sources.iter().map(|(_, d, _)| *d).max();
        }

        let distinct_sources: HashSet<String> = sources.iter().map(|(u, _, _)| host_of(u)).collect();
        let min_required = MIN_DISTINCT_SOURCES;
        let ok = distinct_sources.len() >= min_required;

        Ok(serde_json::json!({
            "query": query,
            "latest_date": best_date.map(|d| d.to_rfc3339()),
            "sources": sources.iter().map(|(u, d, s)| serde_json::json!({
                "url": u, "date": d.to_rfc3339(), "authority": s
            })).collect::<Vec<_>>(),
            "corroboration": {
                "distinct_sources": distinct_sources.len(),
                "min_required": min_required,
                "credibility_threshold": CREDIBLE_AUTHORITY_THRESHOLD,
                "ok": ok,
            },
            "total_collected": total_collected,
            "iterations": iterations,
        }))
    }
}

impl Tool for LatestFinder {
    const NAME: &'static str = "latest_finder";
    type Error = LatestFinderError;
    type Args = LatestFinderArgs;
    type Output = String;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: "latest_finder".to_string(),
            description: "Find the most recent, corroborated date or event for a topic by \
                issuing recency-biased searches until two credible sources agree."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The topic or entity to investigate" }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let result = self.run(&args.query, &CancellationToken::new()).await?;
        Ok(result.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_scores_known_hosts() {
        assert_eq!(authority_score("https://www.sec.gov/filing"), 100);
        assert_eq!(authority_score("https://en.wikipedia.org/wiki/X"), 85);
        assert_eq!(authority_score("not-a-url"), 0);
    }

    #[test]
    fn parses_rfc3339_and_plain_dates() {
        assert!(parse_date("2024-03-01T00:00:00Z").is_some());
        assert!(parse_date("2024-03-01").is_some());
        assert!(parse_date("not a date").is_none());
    }

    #[test]
    fn host_of_strips_scheme_and_path() {
        assert_eq!(host_of("https://www.reuters.com/article/x"), "www.reuters.com");
        assert_eq!(host_of("not-a-url"), "");
    }

    struct RepeatingBackend;

    #[async_trait::async_trait]
    impl SearchBackend for RepeatingBackend {
        async fn search(
            &self,
            _query: &str,
            _options: SearchOptions,
        ) -> Result<Vec<crate::search::SearchHit>, crate::search::SearchError> {
            Ok(vec![crate::search::SearchHit {
                title: Some("Same Article".to_string()),
                url: "https://www.reuters.com/article".to_string(),
                snippet: None,
                content: None,
                published_date: Some("2024-03-01T00:00:00Z".to_string()),
            }])
        }
    }

    #[tokio::test]
    async fn stops_after_two_iterations_when_top_article_does_not_change() {
        let finder = LatestFinder::new(Arc::new(RepeatingBackend));
        let result = finder.run("Acme Corp", &CancellationToken::new()).await.unwrap();
        assert_eq!(result["iterations"], 2);
        assert_eq!(result["latest_date"], "2024-03-01T00:00:00+00:00");
    }
}
