//! Runtime settings for the widget-generation pipeline.
//!
//! Everything is loaded from environment variables (with `.env` support)
//! so deployments can tune the model, sampling, and budget knobs without
//! a rebuild.

use std::str::FromStr;
use std::time::Duration;

/// Pipeline configuration.
///
/// Sampling temperatures are per step: routing wants near-deterministic
/// output, chart styling tolerates more creativity.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Completion model identifier.
    pub model: String,

    /// API key for the completion service.
    pub api_key: String,

    /// Base URL of the completion service (OpenAI-compatible).
    pub base_url: String,

    /// Estimated-token budget before chat history is summarized.
    pub context_token_limit: usize,

    /// Hard ceiling on filter-option rows, regardless of caller limit.
    pub options_limit_cap: usize,

    /// Timeout applied to every completion call.
    pub completion_timeout: Duration,

    pub router_temperature: f32,
    pub schema_temperature: f32,
    pub query_temperature: f32,
    pub filter_temperature: f32,
    pub chart_temperature: f32,
    pub summarizer_temperature: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            context_token_limit: 64_000,
            options_limit_cap: 500,
            completion_timeout: Duration::from_secs(60),
            router_temperature: 0.2,
            schema_temperature: 0.3,
            query_temperature: 0.4,
            filter_temperature: 0.3,
            chart_temperature: 0.5,
            summarizer_temperature: 0.3,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            model: env_or("OPENAI_MODEL", defaults.model.clone()),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: env_or("OPENAI_BASE_URL", defaults.base_url.clone()),
            context_token_limit: env_parsed(
                "CONTEXT_TOKEN_LIMIT",
                defaults.context_token_limit,
            ),
            options_limit_cap: env_parsed("OPTIONS_LIMIT_CAP", defaults.options_limit_cap),
            completion_timeout: Duration::from_secs(env_parsed(
                "COMPLETION_TIMEOUT_SECS",
                defaults.completion_timeout.as_secs(),
            )),
            ..defaults
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
