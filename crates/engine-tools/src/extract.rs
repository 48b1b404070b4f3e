//! Page-content extraction helpers shared by `web_search` and `latest_finder`.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_CONTENT_CHARS: usize = 8000;

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</\1>").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<[^>]+>").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strip scripts/styles/tags from raw HTML and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let no_scripts = script_style_re().replace_all(html, " ");
    let no_tags = tag_re().replace_all(&no_scripts, " ");
    let collapsed = whitespace_re().replace_all(&no_tags, " ");
    collapsed.trim().to_string()
}

/// Truncate to a char boundary within `MAX_CONTENT_CHARS`.
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CONTENT_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_CONTENT_CHARS).collect()
}

/// Fetch a URL, strip and truncate its body. Returns `None` on any failure —
/// callers treat content-fetch as best-effort, never fatal to the surrounding
/// tool call. Races the per-request timeout against `cancel` so a cancelled
/// request's in-flight fetches abort immediately rather than running to
/// completion (spec §5 cooperative cancellation).
pub async fn fetch_page_content(client: &reqwest::Client, url: &str, cancel: &CancellationToken) -> Option<String> {
    let response = tokio::select! {
        result = tokio::time::timeout(FETCH_TIMEOUT, client.get(url).send()) => match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                debug!("fetch failed for {}: {}", url, e);
                return None;
            }
            Err(_) => {
                debug!("fetch timed out for {}", url);
                return None;
            }
        },
        _ = cancel.cancelled() => {
            debug!("fetch for {} aborted by cancellation", url);
            return None;
        }
    };

    if !response.status().is_success() {
        return None;
    }

    match response.text().await {
        Ok(body) => Some(truncate(&strip_html(&body))),
        Err(e) => {
            warn!("failed to read body for {}: {}", url, e);
            None
        }
    }
}

fn jsonld_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)"datePublished"\s*:\s*"([^"]+)""#).unwrap()
    })
}

fn og_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<meta[^>]+property=["']article:published_time["'][^>]+content=["']([^"']+)["']"#).unwrap()
    })
}

fn time_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?is)<time[^>]+datetime=["']([^"']+)["']"#).unwrap())
}

fn loose_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap())
}

/// Extract a best-effort publication date from raw HTML, trying
/// JSON-LD, then OpenGraph, then `<time>`, then a loose `YYYY-MM-DD` scan.
pub fn extract_published_date(html: &str) -> Option<String> {
    jsonld_date_re()
        .captures(html)
        .or_else(|| og_date_re().captures(html))
        .or_else(|| time_tag_re().captures(html))
        .or_else(|| loose_date_re().captures(html))
        .map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_and_tags() {
        let html = "<html><head><script>evil()</script></head><body><p>Hello  world</p></body></html>";
        assert_eq!(strip_html(html), "Hello world");
    }

    #[test]
    fn extracts_jsonld_date() {
        let html = r#"<script type="application/ld+json">{"datePublished": "2024-03-01T00:00:00Z"}</script>"#;
        assert_eq!(
            extract_published_date(html).as_deref(),
            Some("2024-03-01T00:00:00Z")
        );
    }

    #[test]
    fn truncates_long_content() {
        let long = "a".repeat(MAX_CONTENT_CHARS + 500);
        let out = truncate(&long);
        assert_eq!(out.chars().count(), MAX_CONTENT_CHARS);
    }
}
