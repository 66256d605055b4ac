// crates/engram-server/src/facts/store.rs
// Durable, transactional fact storage with temporal versioning

use std::sync::Arc;

use anyhow::Result as AnyResult;
use rusqlite::{params, Connection, TransactionBehavior};

use crate::db::DatabasePool;
use crate::{EngramError, Result};

use super::normalize::{normalize_fact_key, normalize_fact_value, rank_from_fact_key};
use super::ranked;

/// A single fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub fact_id: String,
    pub project_id: String,
    pub fact_key: String,
    pub value_text: String,
    pub value_type: String,
    pub confidence: f64,
    pub source_message_uuid: Option<String>,
    pub created_at: String,
    pub effective_at: String,
    pub supersedes_fact_id: Option<String>,
    pub is_current: bool,
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        fact_id: row.get("fact_id")?,
        project_id: row.get("project_id")?,
        fact_key: row.get("fact_key")?,
        value_text: row.get("value_text")?,
        value_type: row.get("value_type")?,
        confidence: row.get("confidence")?,
        source_message_uuid: row.get("source_message_uuid")?,
        created_at: row.get("created_at")?,
        effective_at: row.get("effective_at")?,
        supersedes_fact_id: row.get("supersedes_fact_id")?,
        is_current: row.get::<_, i64>("is_current")? != 0,
    })
}

const FACT_COLUMNS: &str = "fact_id, project_id, fact_key, value_text, value_type, confidence, \
     source_message_uuid, created_at, effective_at, supersedes_fact_id, is_current";

/// Per-project fact store handle.
pub struct FactStore {
    pool: Arc<DatabasePool>,
    project_id: String,
}

impl FactStore {
    pub fn new(pool: Arc<DatabasePool>, project_id: impl Into<String>) -> Self {
        Self {
            pool,
            project_id: project_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Store a fact, superseding any current value for the same key.
    ///
    /// Runs as one immediate transaction: the prior current row is marked
    /// superseded and the new row inserted with `supersedes_fact_id`
    /// pointing at it.
    pub async fn store_fact(
        &self,
        fact_key: &str,
        value_text: &str,
        confidence: f64,
        source_message_uuid: &str,
    ) -> Result<String> {
        let (normalized_key, _) = normalize_fact_key(fact_key);
        if normalized_key.is_empty() {
            return Err(EngramError::InvalidInput("empty fact key".to_string()));
        }
        let (normalized_value, _) = normalize_fact_value(value_text, false);

        let project_id = self.project_id.clone();
        let message_uuid = source_message_uuid.to_string();
        self.pool
            .interact_mut_with_retry(move |conn| {
                store_fact_sync(
                    conn,
                    &project_id,
                    &normalized_key,
                    &normalized_value,
                    confidence,
                    &message_uuid,
                )
            })
            .await
            .map_err(into_engram_error)
    }

    /// Read the unique current fact for a key.
    pub async fn get_current_fact(&self, fact_key: &str) -> Result<Option<Fact>> {
        let project_id = self.project_id.clone();
        let key = fact_key.to_string();
        self.pool
            .interact(move |conn| get_current_fact_sync(conn, &project_id, &key))
            .await
            .map_err(into_engram_error)
    }

    /// Substring search against fact_key and value_text over current rows.
    pub async fn search_current_facts(
        &self,
        query: &str,
        limit: usize,
        exclude_message_uuid: Option<String>,
    ) -> Result<Vec<Fact>> {
        let project_id = self.project_id.clone();
        let query = query.to_string();
        self.pool
            .interact(move |conn| {
                search_current_facts_sync(
                    conn,
                    &project_id,
                    &query,
                    limit,
                    exclude_message_uuid.as_deref(),
                )
            })
            .await
            .map_err(into_engram_error)
    }

    /// Read a ranked list as `(rank, value_text, fact_key, source_message_uuid)`
    /// tuples, sorted by rank.
    pub async fn get_ranked_list(
        &self,
        list_key: &str,
    ) -> Result<Vec<(u32, String, String, Option<String>)>> {
        let facts = self.get_ranked_list_facts(list_key).await?;
        Ok(facts
            .into_iter()
            .filter_map(|fact| {
                rank_from_fact_key(&fact.fact_key).map(|rank| {
                    (
                        rank,
                        fact.value_text,
                        fact.fact_key,
                        fact.source_message_uuid,
                    )
                })
            })
            .collect())
    }

    /// Read a ranked list as full fact rows, sorted by rank.
    pub async fn get_ranked_list_facts(&self, list_key: &str) -> Result<Vec<Fact>> {
        let project_id = self.project_id.clone();
        let list_key = list_key.to_string();
        self.pool
            .interact(move |conn| get_ranked_list_facts_sync(conn, &project_id, &list_key))
            .await
            .map_err(into_engram_error)
    }

    pub(crate) fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }
}

/// Convert pool-level anyhow errors, preserving typed EngramErrors.
pub(crate) fn into_engram_error(err: anyhow::Error) -> EngramError {
    if crate::db::pool::is_sqlite_contention(&err) {
        return EngramError::Busy(err.to_string());
    }
    match err.downcast::<EngramError>() {
        Ok(typed) => typed,
        Err(err) => EngramError::Anyhow(err),
    }
}

fn store_fact_sync(
    conn: &mut Connection,
    project_id: &str,
    fact_key: &str,
    value_text: &str,
    confidence: f64,
    message_uuid: &str,
) -> AnyResult<String> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let previous: Option<String> = tx
        .query_row(
            "SELECT fact_id FROM project_facts \
             WHERE project_id = ?1 AND fact_key = ?2 AND is_current = 1 \
             ORDER BY effective_at DESC, created_at DESC, id DESC LIMIT 1",
            params![project_id, fact_key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if previous.is_some() {
        ranked::mark_not_current(&tx, project_id, fact_key)?;
    }
    let fact_id = ranked::insert_fact_row(
        &tx,
        project_id,
        fact_key,
        value_text,
        confidence,
        message_uuid,
        previous.as_deref(),
    )?;

    tx.commit()?;
    tracing::debug!("Stored fact {} = '{}'", fact_key, value_text);
    Ok(fact_id)
}

fn get_current_fact_sync(
    conn: &Connection,
    project_id: &str,
    fact_key: &str,
) -> AnyResult<Option<Fact>> {
    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM project_facts \
         WHERE project_id = ?1 AND fact_key = ?2 AND is_current = 1 \
         ORDER BY effective_at DESC, created_at DESC, id DESC LIMIT 1"
    );
    conn.query_row(&sql, params![project_id, fact_key], fact_from_row)
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
}

fn search_current_facts_sync(
    conn: &Connection,
    project_id: &str,
    query: &str,
    limit: usize,
    exclude_message_uuid: Option<&str>,
) -> AnyResult<Vec<Fact>> {
    let pattern = format!("%{query}%");
    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM project_facts \
         WHERE project_id = ?1 AND is_current = 1 \
           AND (fact_key LIKE ?2 OR value_text LIKE ?2) \
         ORDER BY fact_key LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id, pattern, limit as i64], fact_from_row)?;

    let mut facts = Vec::new();
    for row in rows {
        let fact = row?;
        if let Some(excluded) = exclude_message_uuid {
            if fact.source_message_uuid.as_deref() == Some(excluded) {
                continue;
            }
        }
        facts.push(fact);
    }
    Ok(facts)
}

fn get_ranked_list_facts_sync(
    conn: &Connection,
    project_id: &str,
    list_key: &str,
) -> AnyResult<Vec<Fact>> {
    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM project_facts \
         WHERE project_id = ?1 AND fact_key LIKE ?2 AND is_current = 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id, format!("{list_key}.%")], fact_from_row)?;

    let mut facts = Vec::new();
    for row in rows {
        let fact = row?;
        if rank_from_fact_key(&fact.fact_key).is_some() {
            facts.push(fact);
        }
    }
    facts.sort_by_key(|f| rank_from_fact_key(&f.fact_key).unwrap_or(u32::MAX));
    Ok(facts)
}
