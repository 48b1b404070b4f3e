use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_url: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_inference_model: String,

    pub search_provider: String,
    pub tavily_api_key: Option<String>,
    pub serpapi_api_key: Option<String>,

    pub database_url: String,

    pub chat_memory_window: usize,
    pub research_max_steps: Option<u32>,
    pub research_max_web_searches: Option<u32>,

    pub http_port: u16,
    /// Bounds the whole agent-loop run for one `/api/enrich` request (spec
    /// §5's "caller's request context deadline"). No per-request deadline
    /// is carried in the HTTP request itself, so this is a server-wide cap.
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            openai_api_url: std::env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY must be set")?,
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_inference_model: std::env::var("OPENAI_INFERENCE_MODEL")
                .unwrap_or_else(|_| std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())),

            search_provider: std::env::var("SEARCH_PROVIDER").unwrap_or_else(|_| "tavily".to_string()),
            tavily_api_key: std::env::var("TAVILY_API_KEY").ok(),
            serpapi_api_key: std::env::var("SERPAPI_API_KEY").ok(),

            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            chat_memory_window: std::env::var("CHAT_MEMORY_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            research_max_steps: std::env::var("RESEARCH_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok()),
            research_max_web_searches: std::env::var("RESEARCH_MAX_WEB_SEARCHES")
                .ok()
                .and_then(|v| v.parse().ok()),

            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        std::env::set_var("OPENAI_API_KEY", "test-key");
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::remove_var("CHAT_MEMORY_WINDOW");
        let config = Config::from_env().unwrap();
        assert_eq!(config.chat_memory_window, 8);
        assert_eq!(config.openai_model, "gpt-4o-mini");
    }
}
