//! Web search tool
//!
//! Backed by the Perplexity chat API. Advertised to the upstream model as a
//! `web_search(query)` function when an API key is configured; executed
//! synchronously by the orchestrator between streaming rounds.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const PERPLEXITY_URL: &str = "https://api.perplexity.ai/chat/completions";

/// Tool execution errors; injected into the conversation, never fatal
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("search returned no answer")]
    Empty,

    #[error("bad tool arguments: {0}")]
    Arguments(String),
}

#[derive(Deserialize)]
struct SearchArguments {
    query: String,
}

/// Perplexity-backed web search
pub struct WebSearch {
    http: reqwest::Client,
    api_key: String,
}

impl WebSearch {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    /// The function schema advertised in chat-completion requests
    pub fn schema() -> serde_json::Value {
        json!({
            "type": "function",
            "function": {
                "name": "web_search",
                "description": "Search the web for current information on a topic.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The search query."
                        }
                    },
                    "required": ["query"]
                }
            }
        })
    }

    /// Execute a search from the model's raw JSON arguments
    pub async fn run(&self, arguments: &str) -> Result<String, ToolError> {
        let args: SearchArguments =
            serde_json::from_str(arguments).map_err(|e| ToolError::Arguments(e.to_string()))?;

        info!("Running web search: {}", args.query);

        let body = json!({
            "model": "sonar",
            "messages": [{"role": "user", "content": args.query}],
        });

        let response = self
            .http
            .post(PERPLEXITY_URL)
            .timeout(Duration::from_secs(30))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ToolError::Request(format!("{}: {}", status, text)));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ToolError::Request(e.to_string()))?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or(ToolError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shape() {
        let schema = WebSearch::schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "web_search");
        assert_eq!(
            schema["function"]["parameters"]["required"][0],
            "query"
        );
    }

    #[test]
    fn test_arguments_parse() {
        let args: SearchArguments = serde_json::from_str("{\"query\":\"rust dns\"}").unwrap();
        assert_eq!(args.query, "rust dns");
        assert!(serde_json::from_str::<SearchArguments>("{}").is_err());
    }
}
