// crates/engram-server/src/llm/mod.rs
// Chat-model clients for the router, planner, and teacher roles

pub mod teacher;

pub use teacher::TeacherClient;

use std::time::Duration;

use async_trait::async_trait;

use crate::{EngramError, Result};

/// A JSON-mode chat model.
///
/// All three model roles (router, query planner, teacher) consume this
/// trait; tests inject scripted fakes through it.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a system + user prompt pair and return the assistant's raw
    /// text, which is expected to be a JSON object.
    async fn complete_json(&self, system: &str, user: &str) -> Result<String>;
}

/// HTTP client for an OpenAI-compatible chat endpoint in JSON-object mode.
pub struct HttpChatModel {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpChatModel {
    pub fn new(endpoint: String, timeout_secs: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint,
            http_client,
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let payload = serde_json::json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngramError::RouterUnavailable(format!(
                        "request to {} timed out: {e}",
                        self.endpoint
                    ))
                } else if e.is_connect() {
                    EngramError::RouterUnavailable(format!(
                        "endpoint {} unreachable: {e}",
                        self.endpoint
                    ))
                } else {
                    EngramError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngramError::Llm(format!("chat endpoint error {status}: {body}")));
        }

        let json: serde_json::Value = response.json().await?;
        let content = extract_assistant_content(&json)
            .ok_or_else(|| EngramError::Llm("chat endpoint returned no assistant message".into()))?;
        if content.trim().is_empty() {
            return Err(EngramError::Llm("chat endpoint returned empty content".into()));
        }
        Ok(content)
    }
}

/// Pull the assistant text out of either the OpenAI chat-completions shape
/// or a bare `{"messages": [...]}` response.
fn extract_assistant_content(json: &serde_json::Value) -> Option<String> {
    if let Some(content) = json["choices"][0]["message"]["content"].as_str() {
        return Some(content.to_string());
    }
    if let Some(messages) = json["messages"].as_array() {
        for msg in messages.iter().rev() {
            if msg["role"].as_str() == Some("assistant") {
                return msg["content"].as_str().map(|s| s.to_string());
            }
        }
    }
    None
}

/// Strip markdown code fences from model output.
///
/// JSON-object mode should never fence, but smaller models occasionally
/// do anyway.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut in_block = false;
    let mut lines = Vec::new();
    for line in trimmed.lines() {
        if line.trim().starts_with("```") {
            in_block = !in_block;
            continue;
        }
        if in_block {
            lines.push(line);
        }
    }
    lines.join("\n").trim().to_string()
}
