//! Upstream LLM integration
//!
//! Speaks the OpenAI-compatible chat-completions contract in streaming
//! mode. Server-sent `data:` lines are parsed incrementally; streamed
//! tool-call argument fragments are accumulated until the model finishes
//! the turn. Only the streaming surface this tunnel consumes is
//! implemented.

pub mod search;

use crate::config::UpstreamConfig;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Upstream errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("rate limited")]
    RateLimited,

    #[error("upstream timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Transient errors are worth one retry; the rest are fatal
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::RateLimited | LlmError::Timeout
        )
    }
}

/// One conversation entry, in the upstream wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: &str) -> Self {
        Self::plain("user", text)
    }

    pub fn assistant(text: &str) -> Self {
        Self::plain("assistant", text)
    }

    /// Assistant entry announcing tool invocations
    pub fn assistant_tool_calls(calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool result entry answering a specific call
    pub fn tool(call_id: &str, text: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(text.to_string()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }

    fn plain(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A completed tool invocation request from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Incremental events surfaced to the orchestrator
#[derive(Debug)]
pub enum StreamEvent {
    /// One streamed content fragment
    Token(String),
    /// The model finished by requesting tool calls
    ToolCalls(Vec<ToolCallRecord>),
    /// The model finished the message
    Done,
}

/// Chat-completion client for one upstream endpoint
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            request_timeout: config.request_timeout,
        }
    }

    /// Stream one chat completion, emitting events into `tx`.
    ///
    /// Returns once the upstream signals the end of the message or requests
    /// tool calls. A dropped receiver means the consumer cancelled; the
    /// stream is abandoned silently.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        tx: Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": 0.7,
            "max_tokens": 1000,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = timeout(self.request_timeout, request)
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited);
            }
            return Err(LlmError::Api(format!("{}: {}", status, text)));
        }

        let mut stream = response.bytes_stream();
        // Byte buffer so multi-byte characters split across network chunks
        // survive; only complete lines are decoded
        let mut line_buf: Vec<u8> = Vec::new();
        // Tool-call fragments arrive keyed by index; collect until finish
        let mut pending_calls: BTreeMap<usize, ToolCallRecord> = BTreeMap::new();
        let mut finish_reason: Option<String> = None;

        'outer: loop {
            let chunk = match timeout(self.request_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk.map_err(|e| LlmError::Network(e.to_string()))?,
                Ok(None) => break,
                Err(_) => return Err(LlmError::Timeout),
            };

            line_buf.extend_from_slice(&chunk);

            while let Some(newline) = line_buf.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = line_buf.drain(..=newline).collect();
                let Ok(line) = std::str::from_utf8(&line_bytes) else {
                    continue;
                };
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }

                let value: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        trace!("Skipping unparseable stream line: {}", e);
                        continue;
                    }
                };

                let choice = &value["choices"][0];
                if let Some(reason) = choice["finish_reason"].as_str() {
                    finish_reason = Some(reason.to_string());
                }

                if let Some(content) = choice["delta"]["content"].as_str() {
                    if !content.is_empty()
                        && tx.send(StreamEvent::Token(content.to_string())).await.is_err()
                    {
                        debug!("Stream consumer dropped, abandoning upstream read");
                        return Ok(());
                    }
                }

                if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
                    for delta in calls {
                        let index = delta["index"].as_u64().unwrap_or(0) as usize;
                        let entry = pending_calls.entry(index).or_insert_with(|| ToolCallRecord {
                            id: String::new(),
                            kind: "function".to_string(),
                            function: FunctionCall {
                                name: String::new(),
                                arguments: String::new(),
                            },
                        });
                        if let Some(id) = delta["id"].as_str() {
                            entry.id = id.to_string();
                        }
                        if let Some(name) = delta["function"]["name"].as_str() {
                            entry.function.name.push_str(name);
                        }
                        if let Some(args) = delta["function"]["arguments"].as_str() {
                            entry.function.arguments.push_str(args);
                        }
                    }
                }
            }
        }

        let event = match finish_reason.as_deref() {
            Some("tool_calls") if !pending_calls.is_empty() => {
                StreamEvent::ToolCalls(pending_calls.into_values().collect())
            }
            _ => StreamEvent::Done,
        };
        let _ = tx.send(event).await;

        Ok(())
    }
}
