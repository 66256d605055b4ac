// crates/engram-server/src/facts/planner.rs
// Facts query planner: converts user queries into deterministic query plans

use std::sync::Arc;

use engram_types::{FactsQueryPlan, OrdinalSource, QueryIntent};

use crate::llm::{strip_code_fences, ChatModel};
use crate::router::ordinal::detect_ordinal_rank;
use crate::{EngramError, Result};

const PLANNER_SYSTEM: &str = "You are a Facts query planner. Convert user queries into \
deterministic query plans. Output ONLY valid JSON, no markdown, no explanation.";

/// Convert a user query into a facts query plan using the planner model.
///
/// The returned plan still carries the raw topic; the dispatcher
/// canonicalizes it before execution. Ordinal ranks missing from the model
/// output are filled in deterministically (`OrdinalSource::Planner`).
pub async fn plan_facts_query(
    model: &Arc<dyn ChatModel>,
    query_text: &str,
) -> Result<(FactsQueryPlan, OrdinalSource)> {
    let prompt = format!(
        r#"Convert the user's query into a deterministic query plan.

OUTPUT FORMAT (JSON only):
{{
  "intent": "facts_get_ranked_list" | "facts_get_by_prefix" | "facts_get_exact_key",
  "list_key": "user.favorites.crypto" (for ranked list queries),
  "topic": "crypto" (for ranked list queries),
  "key_prefix": "user.favorites" (for prefix queries),
  "fact_key": "user.email" (for exact key queries),
  "limit": 100,
  "include_ranks": true,
  "rank": null (for full list) or 2 (for "second favorite"), 3 (for "third favorite"), etc.
}}

INTENT RULES:
1. facts_get_ranked_list: the user asks for a ranked list ("What are my
   favorite cryptos?") or a specific rank ("What is my second favorite
   crypto?"). ALWAYS extract the topic; if it does not exist the system
   returns empty results, which is fine. Set "rank" for ordinal queries,
   null for full lists.
2. facts_get_by_prefix: the query has no topic at all ("Show all my
   favorites"). Requires key_prefix.
3. facts_get_exact_key: a specific fact ("What is my email?"). Requires
   fact_key.

SCHEMA LOCK: ranked lists always use user.favorites.<topic>.<rank>.

User query: {query_text}

Output JSON:"#
    );

    tracing::debug!("Planning facts query: {}", query_text);
    let raw = model.complete_json(PLANNER_SYSTEM, &prompt).await?;
    let json_text = strip_code_fences(&raw);
    let mut plan: FactsQueryPlan = serde_json::from_str(&json_text)
        .map_err(|e| EngramError::Llm(format!("query planner returned invalid JSON: {e}")))?;

    let mut ordinal_parse_source = OrdinalSource::None;
    if plan.intent == QueryIntent::FactsGetRankedList && plan.rank.is_none() {
        if let Some(detected) = detect_ordinal_rank(query_text) {
            plan.rank = Some(detected);
            ordinal_parse_source = OrdinalSource::Planner;
            if plan.limit > 1 {
                plan.limit = 1;
            }
            tracing::info!("Detected ordinal rank {} (ordinal_parse_source=planner)", detected);
        }
    }

    tracing::debug!(
        "Generated plan: intent={:?}, topic={:?}, rank={:?}",
        plan.intent,
        plan.topic,
        plan.rank
    );
    Ok((plan, ordinal_parse_source))
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
    async fn test_planner_parses_plan() {
        let model: Arc<dyn ChatModel> = Arc::new(FixedModel(
            r#"{"intent": "facts_get_ranked_list", "topic": "crypto", "list_key": "user.favorites.crypto", "limit": 25, "include_ranks": true, "rank": null}"#
                .to_string(),
        ));
        let (plan, source) = plan_facts_query(&model, "What are my favorite cryptos?")
            .await
            .expect("plan");
        assert_eq!(plan.intent, QueryIntent::FactsGetRankedList);
        assert_eq!(plan.topic.as_deref(), Some("crypto"));
        assert_eq!(source, OrdinalSource::None);
    }

    #[tokio::test]
    async fn test_planner_fills_missing_ordinal() {
        let model: Arc<dyn ChatModel> = Arc::new(FixedModel(
            r#"{"intent": "facts_get_ranked_list", "topic": "crypto", "limit": 25, "rank": null}"#
                .to_string(),
        ));
        let (plan, source) = plan_facts_query(&model, "What is my second favorite crypto?")
            .await
            .expect("plan");
        assert_eq!(plan.rank, Some(2));
        assert_eq!(plan.limit, 1);
        assert_eq!(source, OrdinalSource::Planner);
    }

    #[tokio::test]
    async fn test_planner_invalid_json_is_error() {
        let model: Arc<dyn ChatModel> = Arc::new(FixedModel("no".to_string()));
        assert!(plan_facts_query(&model, "query").await.is_err());
    }
}
