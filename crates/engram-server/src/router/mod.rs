// crates/engram-server/src/router/mod.rs
// Content-plane router: deterministic overrides first, then the model

pub mod ordinal;
pub mod patterns;

use std::sync::Arc;
use std::time::{Duration, Instant};

use engram_types::{PlanCandidate, RankSpec, RoutingPlan, RoutingPlanWire};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::{strip_code_fences, ChatModel};
use crate::transcript::TranscriptMessage;
use crate::{EngramError, Result};

/// Throttle window for router-unavailable logging.
const UNAVAILABLE_LOG_INTERVAL: Duration = Duration::from_secs(60);

static LAST_FAVORITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blast\s+favorite\b").expect("static regex"));

const ROUTER_SYSTEM: &str = "You are a deterministic message router. Your ONLY job is to \
classify messages and output JSON.\n\n\
CRITICAL PATTERN (CHECK FIRST):\n\
If the message contains \"My favorite\" + topic + \"is/are\" + value(s):\n\
  -> content_plane=\"facts\", operation=\"write\", reasoning_required=false\n\
  -> MUST populate facts_write_candidate with topic and value(s)\n\
  -> This is ALWAYS facts/write, NEVER index or chat\n\n\
Output ONLY valid JSON matching the routing plan schema. No markdown, no explanation, \
no code fences.";

/// Router over the four content planes.
///
/// Strong patterns are resolved deterministically before the model is
/// consulted; the model's output is schema-validated with one corrective
/// retry, and everything else falls back to the chat plane.
pub struct Router {
    model: Option<Arc<dyn ChatModel>>,
    last_unavailable_log: std::sync::Mutex<Option<Instant>>,
}

impl Router {
    pub fn new(model: Option<Arc<dyn ChatModel>>) -> Self {
        Self {
            model,
            last_unavailable_log: std::sync::Mutex::new(None),
        }
    }

    /// Route a user message to a content plane.
    ///
    /// Never fails: routing errors degrade to the chat fallback plan.
    pub async fn route(&self, user_message: &str, history: &[TranscriptMessage]) -> RoutingPlan {
        // Deterministic override runs before the model
        if let Some(plan) = patterns::match_override(user_message) {
            tracing::info!(
                plane = ?plan.content_plane,
                operation = ?plan.operation,
                why = %plan.why,
                "Routing via deterministic override"
            );
            return plan;
        }

        let Some(model) = &self.model else {
            return RoutingPlan::chat_fallback("no router model configured");
        };

        match self.route_with_model(model, user_message, history).await {
            Ok(mut plan) => {
                enforce_rank_directives(&mut plan, user_message);
                tracing::info!(
                    plane = ?plan.content_plane,
                    operation = ?plan.operation,
                    confidence = plan.confidence,
                    why = %plan.why,
                    "Validated routing plan"
                );
                plan
            }
            Err(e) => {
                self.log_unavailable(&e);
                RoutingPlan::chat_fallback(format!("router failed: {e}"))
            }
        }
    }

    async fn route_with_model(
        &self,
        model: &Arc<dyn ChatModel>,
        user_message: &str,
        history: &[TranscriptMessage],
    ) -> Result<RoutingPlan> {
        let prompt = build_routing_prompt(user_message, history);
        let raw = model.complete_json(ROUTER_SYSTEM, &prompt).await?;

        match parse_plan(&raw) {
            Ok(plan) => Ok(plan),
            Err(first_error) => {
                // One corrective retry with the validation error in context
                tracing::warn!(
                    "Router schema validation failed, retrying with corrective prompt: {}",
                    first_error
                );
                let corrective = format!(
                    "The previous response did not match the routing plan schema.\n\
                     Error: {first_error}\n\n\
                     Original user message: {user_message}\n\n\
                     Your previous (invalid) response was:\n{}\n\n\
                     Output the corrected JSON now:",
                    &raw.chars().take(500).collect::<String>()
                );
                let retry = model.complete_json(ROUTER_SYSTEM, &corrective).await?;
                parse_plan(&retry)
                    .map_err(|e| EngramError::RouterSchemaInvalid(e.to_string()))
            }
        }
    }

    /// Log router unavailability at most once per minute.
    fn log_unavailable(&self, error: &EngramError) {
        let mut last = match self.last_unavailable_log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let should_log = last
            .map(|t| now.duration_since(t) >= UNAVAILABLE_LOG_INTERVAL)
            .unwrap_or(true);
        if should_log {
            tracing::warn!("Router unavailable, falling back to chat: {}", error);
            *last = Some(now);
        }
    }
}

/// Parse and validate a raw model response into a routing plan.
fn parse_plan(raw: &str) -> Result<RoutingPlan> {
    let json_text = strip_code_fences(raw);
    let wire: RoutingPlanWire = serde_json::from_str(&json_text)
        .map_err(|e| EngramError::RouterSchemaInvalid(format!("invalid JSON: {e}")))?;
    Ok(wire.validate()?)
}

/// Post-parse rank enforcement.
///
/// The user's explicit ordinal always wins: a missing rank is filled in
/// from the message, and a contradicting model rank is overruled.
fn enforce_rank_directives(plan: &mut RoutingPlan, user_message: &str) {
    match &mut plan.candidate {
        PlanCandidate::FactsRead(candidate) => {
            if LAST_FAVORITE.is_match(user_message) {
                if candidate.rank != Some(RankSpec::Last) {
                    tracing::info!("Detected 'last favorite' query, setting sentinel rank");
                    candidate.rank = Some(RankSpec::Last);
                }
                return;
            }
            if let Some(detected) = ordinal::detect_ordinal_rank(user_message) {
                let detected = RankSpec::Nth(detected);
                if candidate.rank != Some(detected) {
                    tracing::info!(
                        "Ordinal rank {:?} detected in message, overriding model rank {:?}",
                        detected,
                        candidate.rank
                    );
                    candidate.rank = Some(detected);
                }
            }
        }
        PlanCandidate::FactsWrite(candidate) => {
            if let Some(detected) = ordinal::detect_write_rank(user_message) {
                // Only treat as a directive when the message carries the
                // "my #N favorite" shape, not any stray number
                if patterns::match_override(user_message).is_some()
                    && candidate.rank != Some(detected)
                {
                    candidate.rank = Some(detected);
                }
            }
        }
        _ => {}
    }
}

fn build_routing_prompt(user_message: &str, history: &[TranscriptMessage]) -> String {
    let mut history_context = String::new();
    if !history.is_empty() {
        history_context.push_str("\n\nRecent conversation:\n");
        for msg in history.iter().rev().take(5).rev() {
            let content: String = msg.content.chars().take(200).collect();
            history_context.push_str(&format!("{}: {}\n", msg.role, content));
        }
    }

    format!(
        r#"You are a deterministic message router. Classify the user's message and output JSON.

PATTERN MATCHING RULES (CHECK IN ORDER):

RULE 1: "My favorite" + topic + "is/are" + value(s), anywhere in the message
  -> content_plane="facts", operation="write", reasoning_required=false
  -> facts_write_candidate MUST be populated:
     - topic: the topic word (e.g. "crypto", "colors", "candy")
     - value: string for a single value, array for multiple (preserve order,
       including numbered lists like "1) XMR, 2) BTC")
     - rank_ordered: true for multiple values or numbered lists
  -> confidence=1.0

RULE 2: "List/Show/What is my favorite X" or ordinal queries ("second favorite")
  -> content_plane="facts", operation="read", reasoning_required=false
  -> facts_read_candidate MUST be populated:
     - topic: the topic word
     - query: the original message
     - rank: numeric rank for ordinal queries ("second" -> 2), null otherwise

RULE 3: "What did we discuss" or "Search for X in my history"
  -> content_plane="index", operation="search", reasoning_required=true
  -> index_candidate MUST be populated with the query

RULE 4: Messages about files ("List files", "Read file X")
  -> content_plane="files", operation="read", reasoning_required=false
  -> files_candidate MUST be populated

RULE 5: Everything else
  -> content_plane="chat", operation="none", reasoning_required=true

OUTPUT SCHEMA:
{{
  "content_plane": "facts" | "index" | "files" | "chat",
  "operation": "write" | "read" | "search" | "none",
  "reasoning_required": boolean,
  "facts_write_candidate": {{"topic": "string", "value": "string" | ["string"], "rank_ordered": boolean}} | null,
  "facts_read_candidate": {{"topic": "string", "query": "string", "rank": number | null}} | null,
  "index_candidate": {{"query": "string"}} | null,
  "files_candidate": {{"query": "string", "path_hint": "string" | null}} | null,
  "confidence": 0.0-1.0,
  "why": "string"
}}

CRITICAL:
- Check RULE 1 FIRST - the "My favorite" pattern is ALWAYS facts/write
- Index is for searching conversational history, NOT for storing preferences
- Output ONLY valid JSON matching the schema - no markdown, no code fences

User message: {user_message}{history_context}

Output JSON:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engram_types::{ContentPlane, Operation, RouteSource};

    /// Scripted model: returns canned responses in order.
    struct ScriptedModel {
        responses: std::sync::Mutex<Vec<Result<String>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete_json(&self, _system: &str, _user: &str) -> Result<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(EngramError::Llm("script exhausted".into()));
            }
            responses.remove(0)
        }
    }

    #[tokio::test]
    async fn test_override_skips_model() {
        // A model that would fail if consulted
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(vec![Err(
            EngramError::RouterUnavailable("down".into()),
        )]));
        let router = Router::new(Some(model));
        let plan = router.route("My favorite candy is Reese's", &[]).await;
        assert_eq!(plan.source, RouteSource::Override);
        assert_eq!(plan.content_plane, ContentPlane::Facts);
        assert_eq!(plan.operation, Operation::Write);
    }

    #[tokio::test]
    async fn test_model_plan_validated() {
        let response = r#"{
            "content_plane": "index",
            "operation": "search",
            "reasoning_required": true,
            "index_candidate": {"query": "the launch plan"},
            "confidence": 0.9,
            "why": "history search"
        }"#;
        let model: Arc<dyn ChatModel> =
            Arc::new(ScriptedModel::new(vec![Ok(response.to_string())]));
        let router = Router::new(Some(model));
        let plan = router
            .route("What did we discuss about the launch?", &[])
            .await;
        assert_eq!(plan.content_plane, ContentPlane::Index);
        assert_eq!(plan.source, RouteSource::Model);
    }

    #[tokio::test]
    async fn test_corrective_retry_then_fallback() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(vec![
            Ok("not json at all".to_string()),
            Ok("still not json".to_string()),
        ]));
        let router = Router::new(Some(model));
        let plan = router.route("tell me something interesting", &[]).await;
        assert_eq!(plan.content_plane, ContentPlane::Chat);
        assert_eq!(plan.source, RouteSource::Fallback);
    }

    #[tokio::test]
    async fn test_corrective_retry_succeeds() {
        let valid = r#"{"content_plane": "chat", "operation": "none", "reasoning_required": true}"#;
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(vec![
            Ok("oops".to_string()),
            Ok(valid.to_string()),
        ]));
        let router = Router::new(Some(model));
        let plan = router.route("hm", &[]).await;
        assert_eq!(plan.content_plane, ContentPlane::Chat);
        assert_eq!(plan.source, RouteSource::Model);
    }

    #[tokio::test]
    async fn test_unavailable_model_falls_back() {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(vec![Err(
            EngramError::RouterUnavailable("endpoint unreachable".into()),
        )]));
        let router = Router::new(Some(model));
        let plan = router.route("random chatter", &[]).await;
        assert_eq!(plan.content_plane, ContentPlane::Chat);
        assert_eq!(plan.source, RouteSource::Fallback);
    }

    #[tokio::test]
    async fn test_post_parse_ordinal_fill() {
        // Model routed correctly but dropped the rank; message shape evades
        // the pre-parse patterns, so the post-parse detector must fill it.
        let response = r#"{
            "content_plane": "facts",
            "operation": "read",
            "reasoning_required": false,
            "facts_read_candidate": {"topic": "crypto", "query": "q", "rank": null},
            "confidence": 0.8,
            "why": "read"
        }"#;
        let model: Arc<dyn ChatModel> =
            Arc::new(ScriptedModel::new(vec![Ok(response.to_string())]));
        let router = Router::new(Some(model));
        let plan = router
            .route("Remind me again which crypto is my second favorite", &[])
            .await;
        match plan.candidate {
            PlanCandidate::FactsRead(c) => assert_eq!(c.rank, Some(RankSpec::Nth(2))),
            other => panic!("unexpected candidate {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_model_rank_contradiction_overruled() {
        let response = r#"{
            "content_plane": "facts",
            "operation": "read",
            "reasoning_required": false,
            "facts_read_candidate": {"topic": "crypto", "query": "q", "rank": 1},
            "confidence": 0.8,
            "why": "read"
        }"#;
        let model: Arc<dyn ChatModel> =
            Arc::new(ScriptedModel::new(vec![Ok(response.to_string())]));
        let router = Router::new(Some(model));
        let plan = router
            .route("Remind me again which crypto is my third favorite", &[])
            .await;
        match plan.candidate {
            PlanCandidate::FactsRead(c) => assert_eq!(c.rank, Some(RankSpec::Nth(3))),
            other => panic!("unexpected candidate {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_model_routes_to_chat() {
        let router = Router::new(None);
        let plan = router.route("anything else", &[]).await;
        assert_eq!(plan.content_plane, ContentPlane::Chat);
    }
}
