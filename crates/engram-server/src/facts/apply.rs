// crates/engram-server/src/facts/apply.rs
// Deterministic facts operations applier
//
// This is the SINGLE write entry point for facts. No other code path
// writes fact rows. Every batch runs as one BEGIN IMMEDIATE transaction
// so the read-max-rank / insert sequence is serialized against other
// writers, and ranked-list invariants are validated before commit.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result as AnyResult;
use engram_types::{
    ApplyResult, DuplicateBlocked, FactsOpKind, FactsOpsResponse, MutationAction, RankMutation,
    RankSource,
};
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use crate::canon::Canonicalizer;
use crate::db::DatabasePool;
use crate::{EngramError, Result};

use super::normalize::{
    canonical_list_key, extract_topic_from_list_key, normalize_fact_key, normalize_fact_value,
    normalize_rank_item,
};
use super::ranked::{self, rank_key};
use super::store::into_engram_error;

/// A fact operation with its topic resolved and values normalized, ready
/// to run inside the transaction.
#[derive(Debug, Clone)]
enum ResolvedOp {
    Ranked {
        index: usize,
        canonical_topic: String,
        list_key: String,
        rank: Option<u32>,
        value: String,
        normalized_value: String,
        confidence: f64,
        warning: Option<String>,
    },
    Set {
        index: usize,
        fact_key: String,
        value: String,
        confidence: f64,
        warnings: Vec<String>,
    },
    ClearRejected {
        index: usize,
        list_key: String,
    },
    Invalid {
        message: String,
    },
}

/// Apply facts operations deterministically.
///
/// Topic canonicalization (alias table only, never the teacher) happens
/// before the transaction; all writes then commit atomically or not at
/// all. Returns [`ApplyResult`] with counts, keys, warnings and per-op
/// errors; invariant violations roll the transaction back and surface as
/// [`EngramError::InvariantViolated`].
pub async fn apply_facts_ops(
    pool: &DatabasePool,
    project_uuid: &str,
    message_uuid: &str,
    ops_response: &FactsOpsResponse,
    canonicalizer: Option<&Canonicalizer>,
) -> Result<ApplyResult> {
    Uuid::parse_str(project_uuid).map_err(|e| {
        EngramError::InvalidInput(format!("invalid project UUID '{project_uuid}': {e}"))
    })?;

    if !ops_response.needs_clarification.is_empty() {
        let mut result = ApplyResult::default();
        result.errors.push(format!(
            "Clarification needed: {}",
            ops_response.needs_clarification.join(", ")
        ));
        tracing::info!("Clarification required, no operations applied");
        return Ok(result);
    }

    if ops_response.ops.is_empty() {
        return Ok(ApplyResult::default());
    }

    tracing::info!(
        ops = ops_response.ops.len(),
        project = %project_uuid,
        message = %message_uuid,
        "Applying facts operations"
    );

    // Resolve topics and normalize values before entering the transaction
    let mut resolved = Vec::with_capacity(ops_response.ops.len());
    for (i, op) in ops_response.ops.iter().enumerate() {
        let index = i + 1;
        match op.op {
            FactsOpKind::RankedListSet => {
                let (Some(list_key), Some(value)) = (&op.list_key, &op.value) else {
                    resolved.push(ResolvedOp::Invalid {
                        message: format!(
                            "Operation {index}: ranked_list_set requires list_key and value"
                        ),
                    });
                    continue;
                };
                let Some(topic) = extract_topic_from_list_key(list_key) else {
                    resolved.push(ResolvedOp::Invalid {
                        message: format!(
                            "Operation {index}: Invalid list_key format: {list_key}. \
                             Expected format: user.favorites.<topic>"
                        ),
                    });
                    continue;
                };
                // Defensive canonicalization; topics should already be
                // canonical by the time ops are built.
                let canonical_topic = match canonicalizer {
                    Some(canon) => canon.canonicalize(&topic, false).await.canonical_topic,
                    None => topic,
                };
                let (normalized_value, warning) = normalize_fact_value(value, true);
                resolved.push(ResolvedOp::Ranked {
                    index,
                    list_key: canonical_list_key(&canonical_topic),
                    canonical_topic,
                    rank: op.rank,
                    value: value.clone(),
                    normalized_value,
                    confidence: op.confidence.unwrap_or(1.0) as f64,
                    warning,
                });
            }
            FactsOpKind::Set => {
                let (Some(fact_key), Some(value)) = (&op.fact_key, &op.value) else {
                    resolved.push(ResolvedOp::Invalid {
                        message: format!("Operation {index}: set requires fact_key and value"),
                    });
                    continue;
                };
                let mut warnings = Vec::new();
                let (normalized_key, key_warning) = normalize_fact_key(fact_key);
                if let Some(w) = key_warning {
                    warnings.push(format!("Operation {index}: {w}"));
                }
                let (normalized_value, value_warning) = normalize_fact_value(value, false);
                if let Some(w) = value_warning {
                    warnings.push(format!("Operation {index}: {w}"));
                }
                resolved.push(ResolvedOp::Set {
                    index,
                    fact_key: normalized_key,
                    value: normalized_value,
                    confidence: op.confidence.unwrap_or(1.0) as f64,
                    warnings,
                });
            }
            FactsOpKind::RankedListClear => {
                resolved.push(ResolvedOp::ClearRejected {
                    index,
                    list_key: op.list_key.clone().unwrap_or_default(),
                });
            }
        }
    }

    let project = project_uuid.to_string();
    let message = message_uuid.to_string();
    let applied = pool
        .interact_mut_with_retry(move |conn| apply_resolved_ops(conn, &project, &message, &resolved))
        .await
        .map_err(into_engram_error)?;

    tracing::info!(
        store_count = applied.store_count,
        update_count = applied.update_count,
        dupes = applied.duplicate_blocked.len(),
        errors = applied.errors.len(),
        message = %message_uuid,
        "Applied facts operations"
    );
    Ok(applied)
}

/// Run the resolved operations inside one immediate transaction.
fn apply_resolved_ops(
    conn: &mut Connection,
    project_uuid: &str,
    message_uuid: &str,
    ops: &[ResolvedOp],
) -> AnyResult<ApplyResult> {
    let mut result = ApplyResult::default();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // Max rank per list within the transaction, so a bulk statement's
    // later appends see its earlier ones without re-reading the database.
    let mut max_rank_cache: HashMap<String, u32> = HashMap::new();
    // list_key -> canonical topic for post-transaction validation
    let mut mutated_lists: BTreeMap<String, String> = BTreeMap::new();

    for op in ops {
        match op {
            ResolvedOp::Ranked {
                index,
                canonical_topic,
                list_key,
                rank: None,
                value,
                normalized_value,
                confidence,
                warning,
            } => {
                if let Some(w) = warning {
                    result.warnings.push(format!("Operation {index}: {w}"));
                }

                // Unranked appends to favorites block on duplicates;
                // explicit ranks never do (they rewrite via MOVE).
                if let Some(existing_rank) =
                    ranked::check_value_exists(&tx, project_uuid, list_key, value)?
                {
                    result.duplicate_blocked.insert(
                        normalize_rank_item(value),
                        DuplicateBlocked {
                            existing_rank,
                            topic: canonical_topic.clone(),
                            list_key: list_key.clone(),
                        },
                    );
                    tracing::info!(
                        "Duplicate blocked: '{}' already at rank {} for topic={}",
                        value,
                        existing_rank,
                        canonical_topic
                    );
                    continue;
                }

                let max_rank = match max_rank_cache.get(list_key) {
                    Some(rank) => *rank,
                    None => ranked::get_max_rank(&tx, project_uuid, list_key)?,
                };
                let assigned_rank = max_rank + 1;
                max_rank_cache.insert(list_key.clone(), assigned_rank);

                let fact_key = rank_key(list_key, assigned_rank);
                ranked::mark_not_current(&tx, project_uuid, &fact_key)?;
                ranked::insert_fact_row(
                    &tx,
                    project_uuid,
                    &fact_key,
                    normalized_value,
                    *confidence,
                    message_uuid,
                    None,
                )?;

                result
                    .rank_assignment_source
                    .insert(fact_key.clone(), RankSource::AtomicAppend);
                result.store_count += 1;
                result.stored_fact_keys.push(fact_key);
                mutated_lists.insert(list_key.clone(), canonical_topic.clone());
                tracing::debug!(
                    "APPEND op {}: '{}' at rank {} (topic={})",
                    index,
                    value,
                    assigned_rank,
                    canonical_topic
                );
            }
            ResolvedOp::Ranked {
                index,
                canonical_topic,
                list_key,
                rank: Some(desired_rank),
                value,
                normalized_value,
                confidence: _,
                warning,
            } => {
                if let Some(w) = warning {
                    result.warnings.push(format!("Operation {index}: {w}"));
                }
                tracing::info!(
                    topic = %canonical_topic,
                    desired_rank,
                    value = %value,
                    "Explicit rank mutation"
                );

                let mutation = ranked::apply_ranked_mutation(
                    &tx,
                    project_uuid,
                    list_key,
                    *desired_rank,
                    value,
                    message_uuid,
                    normalized_value,
                )?;

                let fact_key = rank_key(list_key, mutation.new_rank);
                result
                    .rank_assignment_source
                    .insert(fact_key.clone(), RankSource::Explicit);
                result.rank_mutations.insert(
                    fact_key.clone(),
                    RankMutation {
                        action: mutation.action,
                        old_rank: mutation.old_rank,
                        new_rank: mutation.new_rank,
                        value: value.clone(),
                        topic: canonical_topic.clone(),
                    },
                );

                match mutation.action {
                    MutationAction::Noop => {
                        // No rows changed; nothing to count
                    }
                    action => {
                        result.update_count += mutation.shifted_items.len();
                        match action {
                            MutationAction::Move => result.update_count += 1,
                            MutationAction::Insert | MutationAction::Append => {
                                result.store_count += 1
                            }
                            MutationAction::Noop => {}
                        }
                        result.stored_fact_keys.push(fact_key);
                        for (_, new_rank, _) in &mutation.shifted_items {
                            result.stored_fact_keys.push(rank_key(list_key, *new_rank));
                        }
                    }
                }

                // Explicit mutations change the list shape; drop any
                // cached max rank so later appends re-read it.
                max_rank_cache.remove(list_key);
                mutated_lists.insert(list_key.clone(), canonical_topic.clone());
            }
            ResolvedOp::Set {
                index,
                fact_key,
                value,
                confidence,
                warnings,
            } => {
                result.warnings.extend(warnings.iter().cloned());

                let previous: Option<(String, String)> = tx
                    .query_row(
                        "SELECT fact_id, value_text FROM project_facts \
                         WHERE project_id = ?1 AND fact_key = ?2 AND is_current = 1 \
                         ORDER BY effective_at DESC, created_at DESC, id DESC LIMIT 1",
                        rusqlite::params![project_uuid, fact_key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let is_update = previous
                    .as_ref()
                    .map(|(_, prior_value)| prior_value != value)
                    .unwrap_or(false);
                if previous.is_some() {
                    ranked::mark_not_current(&tx, project_uuid, fact_key)?;
                }
                ranked::insert_fact_row(
                    &tx,
                    project_uuid,
                    fact_key,
                    value,
                    *confidence,
                    message_uuid,
                    previous.as_ref().map(|(id, _)| id.as_str()),
                )?;

                if is_update {
                    result.update_count += 1;
                    tracing::debug!("UPDATE op {}: {} = {}", index, fact_key, value);
                } else {
                    result.store_count += 1;
                    tracing::debug!("STORE op {}: {} = {}", index, fact_key, value);
                }
                result.stored_fact_keys.push(fact_key.clone());
            }
            ResolvedOp::ClearRejected { index, list_key } => {
                // Reserved operation: rejected outright rather than risking
                // a partially cleared list.
                tracing::warn!("ranked_list_clear rejected for {}", list_key);
                result.errors.push(format!(
                    "Operation {index}: ranked_list_clear is not supported"
                ));
            }
            ResolvedOp::Invalid { message } => {
                result.errors.push(message.clone());
            }
        }
    }

    // Validate every mutated ranked list before commit
    for (list_key, canonical_topic) in &mutated_lists {
        let items = ranked::get_ranked_list_items(&tx, project_uuid, list_key)?;
        if let Err(violation) = ranked::validate_ranked_list_invariants(&items, list_key) {
            tracing::error!(
                "Ranked list invariant violation for '{}': {}",
                list_key,
                violation
            );
            // Dropping the transaction without commit rolls everything back
            return Err(EngramError::InvariantViolated(format!(
                "Ranked list invariant violation for {canonical_topic}: {violation}"
            ))
            .into());
        }
    }

    tx.commit()?;
    Ok(result)
}
