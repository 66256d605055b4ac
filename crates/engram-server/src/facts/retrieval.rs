// crates/engram-server/src/facts/retrieval.rs
// Deterministic facts retrieval executor
//
// Executes a FactsQueryPlan with direct DB queries, no model calls.
// Empty and out-of-range ordinal reads are first-class answers here, not
// errors; the dispatcher turns them into deterministic responses.

use engram_types::{FactRecord, FactsAnswer, FactsQueryPlan, OrdinalSource, QueryIntent};
use uuid::Uuid;

use crate::{EngramError, Result};

use super::normalize::{canonical_list_key, normalize_rank_item, rank_from_fact_key};
use super::store::FactStore;

/// Execute a facts query plan deterministically.
///
/// `exclude_message_uuid` drops facts sourced from the message currently
/// being processed, so a read never cites itself.
pub async fn execute_facts_plan(
    store: &FactStore,
    plan: &FactsQueryPlan,
    exclude_message_uuid: Option<&str>,
    ordinal_parse_source: OrdinalSource,
) -> Result<FactsAnswer> {
    Uuid::parse_str(store.project_id()).map_err(|e| {
        EngramError::InvalidInput(format!("invalid project UUID '{}': {e}", store.project_id()))
    })?;

    let mut answer = FactsAnswer::empty(ordinal_parse_source);

    match plan.intent {
        QueryIntent::FactsGetRankedList => {
            execute_ranked_list(store, plan, exclude_message_uuid, &mut answer).await?;
        }
        QueryIntent::FactsGetByPrefix => {
            let Some(prefix) = plan.key_prefix.as_deref() else {
                tracing::warn!("Missing key_prefix for prefix query");
                return Ok(answer);
            };
            let facts = store
                .search_current_facts(prefix, plan.limit, exclude_message_uuid.map(String::from))
                .await?;
            for fact in facts {
                if !fact.fact_key.starts_with(prefix) {
                    continue;
                }
                if let Some((parent, _)) = fact.fact_key.rsplit_once('.') {
                    answer.canonical_keys.push(parent.to_string());
                }
                answer.facts.push(FactRecord {
                    fact_key: fact.fact_key,
                    value_text: fact.value_text,
                    rank: None,
                    source_message_uuid: fact.source_message_uuid,
                    created_at: Some(fact.created_at),
                });
            }
            answer.canonical_keys.sort();
            answer.canonical_keys.dedup();
            tracing::debug!("Retrieved {} facts for prefix {}", answer.facts.len(), prefix);
        }
        QueryIntent::FactsGetExactKey => {
            let Some(fact_key) = plan.fact_key.as_deref() else {
                tracing::warn!("Missing fact_key for exact key query");
                return Ok(answer);
            };
            if let Some(fact) = store.get_current_fact(fact_key).await? {
                let excluded = exclude_message_uuid
                    .map(|uuid| fact.source_message_uuid.as_deref() == Some(uuid))
                    .unwrap_or(false);
                if !excluded {
                    answer.canonical_keys.push(fact_key.to_string());
                    answer.facts.push(FactRecord {
                        fact_key: fact.fact_key,
                        value_text: fact.value_text,
                        rank: None,
                        source_message_uuid: fact.source_message_uuid,
                        created_at: Some(fact.created_at),
                    });
                }
            }
        }
    }

    answer.count = answer.facts.len();
    Ok(answer)
}

async fn execute_ranked_list(
    store: &FactStore,
    plan: &FactsQueryPlan,
    exclude_message_uuid: Option<&str>,
    answer: &mut FactsAnswer,
) -> Result<()> {
    let list_key = match (&plan.list_key, &plan.topic) {
        (Some(list_key), _) => list_key.clone(),
        (None, Some(topic)) => canonical_list_key(topic),
        (None, None) => {
            tracing::warn!("Missing list_key and topic for ranked list query");
            return Ok(());
        }
    };

    let mut facts = store.get_ranked_list_facts(&list_key).await?;
    if let Some(excluded) = exclude_message_uuid {
        facts.retain(|f| f.source_message_uuid.as_deref() != Some(excluded));
    }

    answer.max_available_rank = facts
        .iter()
        .filter_map(|f| rank_from_fact_key(&f.fact_key))
        .max();

    // Safety net: drop duplicates by normalized value, keeping the lowest
    // rank. Under invariants this never fires.
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let before = facts.len();
    facts.retain(|fact| seen.insert(normalize_rank_item(&fact.value_text)));
    if facts.len() < before {
        tracing::warn!(
            "Deduplication removed {} duplicate(s) from ranked list {}",
            before - facts.len(),
            list_key
        );
    }

    answer.rank_applied = plan.rank.is_some();
    let mut returned = 0usize;
    for fact in facts {
        let fact_rank = rank_from_fact_key(&fact.fact_key);
        if let Some(wanted) = plan.rank {
            if fact_rank != Some(wanted) {
                continue;
            }
            answer.rank_result_found = Some(true);
        } else if plan.limit > 0 && returned >= plan.limit {
            // Storage is unbounded; the limit only paginates list reads.
            break;
        }

        if let Some((parent, _)) = fact.fact_key.rsplit_once('.') {
            if parent.starts_with("user.favorites.") {
                answer.canonical_keys.push(parent.to_string());
            }
        }
        answer.facts.push(FactRecord {
            fact_key: fact.fact_key,
            value_text: fact.value_text,
            rank: fact_rank,
            source_message_uuid: fact.source_message_uuid,
            created_at: Some(fact.created_at),
        });
        returned += 1;
    }
    answer.canonical_keys.sort();
    answer.canonical_keys.dedup();

    if answer.rank_applied && answer.rank_result_found.is_none() {
        answer.rank_result_found = Some(false);
    }

    if let Some(rank) = plan.rank {
        tracing::info!(
            "Retrieved {} ranked facts for {} at rank {} (found={:?}, max_available={:?})",
            answer.facts.len(),
            list_key,
            rank,
            answer.rank_result_found,
            answer.max_available_rank
        );
    } else {
        tracing::debug!(
            "Retrieved {} ranked facts for {} (max_available={:?})",
            answer.facts.len(),
            list_key,
            answer.max_available_rank
        );
    }
    Ok(())
}
