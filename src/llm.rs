//! Completion-service client.
//!
//! Every agent issues exactly one chat-completion call per run and expects
//! a JSON object back. The client is a trait so the orchestrator can be
//! driven by a scripted stand-in under test.

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One role-tagged message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Black-box completion service: messages in, parsed JSON out.
///
/// Any transport error, non-success status, or non-JSON payload is a
/// [`PipelineError::Completion`] carrying the raw text. Timeouts are
/// enforced by the implementation and surface the same way.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<Value>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.completion_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<Value> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Completion(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Completion(format!(
                "completion service returned {}: {}",
                status,
                snippet(&text)
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Completion(format!("unreadable completion payload: {}", e)))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                PipelineError::Completion("no content in completion response".to_string())
            })?;

        serde_json::from_str(content).map_err(|_| {
            PipelineError::Completion(format!("model returned non-JSON content: {}", snippet(content)))
        })
    }
}

/// First 200 chars of a raw payload, for error messages.
fn snippet(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
