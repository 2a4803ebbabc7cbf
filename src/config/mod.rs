//! Configuration management
//!
//! All configuration is captured once at startup from the environment plus
//! CLI overrides and passed around as immutable values; there are no
//! process-wide singletons and nothing is persisted.

use crate::codec::SecretKey;
use std::time::Duration;

/// Environment variable holding the base64 pre-shared key
pub const KEY_ENV: &str = "LLM_PROXY_KEY";

/// Environment variable overriding the query-name suffix
pub const SUFFIX_ENV: &str = "LLM_DNS_SUFFIX";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP bind host
    pub host: String,
    /// UDP bind port
    pub port: u16,
    /// Query-name suffix the server answers for
    pub suffix: String,
    /// Pre-shared symmetric key
    pub key: SecretKey,
    /// Upstream chat-completion endpoint
    pub upstream: UpstreamConfig,
    /// Perplexity API key; enables the web_search tool when present
    pub search_api_key: Option<String>,
    /// Evict sessions idle longer than this
    pub idle_timeout: Duration,
    /// How often the eviction sweeper runs
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Build from environment with an already-resolved key.
    ///
    /// Fails when `OPENAI_API_KEY` is missing; every other setting has a
    /// default or is optional.
    pub fn from_env(key: SecretKey) -> Result<Self, crate::Error> {
        let upstream = UpstreamConfig::from_env()?;

        Ok(Self {
            host: "127.0.0.1".to_string(),
            port: crate::DEFAULT_PORT,
            suffix: suffix_from_env(),
            key,
            upstream,
            search_api_key: std::env::var("PERPLEXITY_API_KEY").ok(),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
        })
    }
}

/// Upstream chat-completion endpoint settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    /// Bearer token
    pub api_key: String,
    /// Model identifier
    pub model: String,
    /// Per-call timeout
    pub request_timeout: Duration,
}

impl UpstreamConfig {
    pub fn from_env() -> Result<Self, crate::Error> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| crate::Error::Config("OPENAI_API_KEY is not set".to_string()))?;

        Ok(Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key,
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            request_timeout: Duration::from_secs(60),
        })
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Server UDP port
    pub port: u16,
    /// Query-name suffix appended to every query
    pub suffix: String,
    /// Pre-shared symmetric key
    pub key: SecretKey,
    /// Per-query timeout
    pub query_timeout: Duration,
    /// Attempts per query before giving up
    pub max_retries: u32,
    /// Delay between `cnt` polls
    pub poll_interval: Duration,
    /// Overall deadline for one turn's response
    pub turn_timeout: Duration,
}

impl ClientConfig {
    /// Build from environment with an already-resolved key.
    pub fn from_env(key: SecretKey) -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: crate::DEFAULT_PORT,
            suffix: suffix_from_env(),
            key,
            query_timeout: Duration::from_secs(5),
            max_retries: 3,
            poll_interval: Duration::from_millis(500),
            turn_timeout: Duration::from_secs(180),
        }
    }
}

/// Read the query-name suffix from the environment, normalized to the form
/// used in comparisons (lowercase, no leading or trailing dot).
pub fn suffix_from_env() -> String {
    normalize_suffix(
        &std::env::var(SUFFIX_ENV).unwrap_or_else(|_| crate::DEFAULT_SUFFIX.to_string()),
    )
}

/// Normalize a suffix string: lowercase, stripped of surrounding dots.
pub fn normalize_suffix(suffix: &str) -> String {
    suffix.trim_matches('.').to_ascii_lowercase()
}
