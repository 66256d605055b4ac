// crates/engram-server/src/llm/teacher.rs
// Teacher model client for topic canonicalization

use std::sync::Arc;

use serde::Deserialize;

use crate::{EngramError, Result};

use super::{strip_code_fences, ChatModel};

/// The teacher's canonicalization decision.
#[derive(Debug, Clone, Deserialize)]
pub struct TeacherDecision {
    pub canonical_topic: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

const TEACHER_SYSTEM: &str = "You are a topic canonicalization authority. \
Given a raw topic expression, decide the single canonical topic word and the \
aliases that should map to it. Output ONLY valid JSON, no markdown.";

/// Client for the large teacher model, invoked only when embedding
/// similarity falls below threshold.
pub struct TeacherClient {
    model: Arc<dyn ChatModel>,
}

impl TeacherClient {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Ask the teacher for the canonical form of a topic.
    pub async fn canonicalize_topic(
        &self,
        raw_topic: &str,
        normalized_topic: &str,
    ) -> Result<TeacherDecision> {
        let prompt = format!(
            r#"Decide the canonical topic for a user preference expression.

Raw expression: {raw_topic}
Normalized: {normalized_topic}

Rules:
- The canonical topic is a short singular noun (e.g. "crypto" for
  "cryptos"/"cryptocurrencies"/"digital currency", "color" for "colors").
- List every alias a user might say for this topic, including the raw
  expression itself.

OUTPUT FORMAT (JSON only):
{{"canonical_topic": "string", "aliases": ["string"], "reasoning": "string"}}"#
        );

        let raw = self.model.complete_json(TEACHER_SYSTEM, &prompt).await?;
        let json_text = strip_code_fences(&raw);
        let decision: TeacherDecision = serde_json::from_str(&json_text)
            .map_err(|e| EngramError::Llm(format!("teacher returned invalid JSON: {e}")))?;

        if decision.canonical_topic.trim().is_empty() {
            return Err(EngramError::Llm("teacher returned empty canonical topic".into()));
        }

        tracing::info!(
            "Teacher canonicalized '{}' -> '{}' with {} aliases",
            raw_topic,
            decision.canonical_topic,
            decision.aliases.len()
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedModel(String);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn complete_json(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_teacher_parses_decision() {
        let model = Arc::new(FixedModel(
            r#"{"canonical_topic": "crypto", "aliases": ["cryptos", "cryptocurrency"]}"#.to_string(),
        ));
        let client = TeacherClient::new(model);
        let decision = client
            .canonicalize_topic("cryptos", "cryptos")
            .await
            .expect("decision");
        assert_eq!(decision.canonical_topic, "crypto");
        assert_eq!(decision.aliases.len(), 2);
    }

    #[tokio::test]
    async fn test_teacher_rejects_invalid_json() {
        let model = Arc::new(FixedModel("not json".to_string()));
        let client = TeacherClient::new(model);
        assert!(client.canonicalize_topic("x", "x").await.is_err());
    }
}
