// crates/engram-server/src/canon/alias.rs
// Global alias table: canonical topic mappings shared across projects
//
// The alias table is separate from facts. It maps human expressions to
// canonical topics and stores each canonical's embedding for similarity
// lookup. Entries are only ever added or replaced, never deleted.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use chrono::Utc;
use rusqlite::params;

use crate::db::pool::{DatabasePool, DbKind};
use crate::embeddings::{blob_to_vec, vec_to_blob};
use crate::Result;

use crate::facts::store::into_engram_error;

/// An alias table entry.
#[derive(Debug, Clone)]
pub struct AliasEntry {
    pub canonical_topic: String,
    pub aliases: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_by: String,
    pub confidence: f64,
    pub created_at: String,
}

/// Result of an alias lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasMatch {
    pub canonical_topic: String,
    /// Which alias matched (the canonical itself also matches).
    pub matched_alias: String,
}

/// Handle to the global alias table database.
///
/// Passed explicitly through the core; tests point their own handle at an
/// isolated in-memory table.
pub struct AliasTable {
    pool: Arc<DatabasePool>,
}

impl AliasTable {
    pub async fn open(path: &Path) -> AnyResult<Self> {
        Ok(Self {
            pool: Arc::new(DatabasePool::open(path, DbKind::Alias).await?),
        })
    }

    pub async fn open_in_memory() -> AnyResult<Self> {
        Ok(Self {
            pool: Arc::new(DatabasePool::open_in_memory(DbKind::Alias).await?),
        })
    }

    /// Add or replace an entry for a canonical topic.
    pub async fn add_entry(
        &self,
        canonical_topic: &str,
        aliases: Vec<String>,
        embedding: Option<Vec<f32>>,
        created_by: &str,
        confidence: f64,
    ) -> Result<()> {
        let canonical = canonical_topic.to_string();
        let created_by = created_by.to_string();
        let alias_count = aliases.len();
        self.pool
            .interact(move |conn| {
                let aliases_json = serde_json::to_string(&aliases)?;
                conn.execute(
                    "INSERT OR REPLACE INTO alias_entries \
                     (canonical_topic, aliases_json, embedding, created_by, confidence, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        canonical,
                        aliases_json,
                        embedding.as_deref().map(vec_to_blob),
                        created_by,
                        confidence,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(into_engram_error)?;

        tracing::info!(
            "Added alias entry: '{}' with {} aliases",
            canonical_topic,
            alias_count
        );
        Ok(())
    }

    /// Find the canonical topic for an alias (exact, case-insensitive).
    ///
    /// The canonical topic itself matches as well as any of its aliases.
    pub async fn find_canonical(&self, alias: &str) -> Result<Option<AliasMatch>> {
        let normalized = alias.to_lowercase().trim().to_string();
        self.pool
            .interact(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT canonical_topic, aliases_json FROM alias_entries")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;

                for row in rows {
                    let (canonical_topic, aliases_json) = row?;
                    let aliases: Vec<String> =
                        serde_json::from_str(&aliases_json).unwrap_or_default();

                    for entry_alias in &aliases {
                        if entry_alias.to_lowercase().trim() == normalized {
                            return Ok(Some(AliasMatch {
                                canonical_topic,
                                matched_alias: entry_alias.clone(),
                            }));
                        }
                    }
                    if canonical_topic.to_lowercase().trim() == normalized {
                        return Ok(Some(AliasMatch {
                            matched_alias: canonical_topic.clone(),
                            canonical_topic,
                        }));
                    }
                }
                Ok(None)
            })
            .await
            .map_err(into_engram_error)
    }

    /// All canonical topics with their embeddings (for similarity lookup).
    pub async fn all_canonical_topics(&self) -> Result<Vec<(String, Option<Vec<f32>>)>> {
        self.pool
            .interact(|conn| {
                let mut stmt =
                    conn.prepare("SELECT canonical_topic, embedding FROM alias_entries")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (canonical_topic, blob) = row?;
                    out.push((canonical_topic, blob.map(|b| blob_to_vec(&b))));
                }
                Ok(out)
            })
            .await
            .map_err(into_engram_error)
    }

    /// Get a specific entry by canonical topic.
    pub async fn get_entry(&self, canonical_topic: &str) -> Result<Option<AliasEntry>> {
        let canonical = canonical_topic.to_string();
        self.pool
            .interact(move |conn| {
                conn.query_row(
                    "SELECT canonical_topic, aliases_json, embedding, created_by, confidence, created_at \
                     FROM alias_entries WHERE canonical_topic = ?1",
                    params![canonical],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(Into::into)
                .map(|row| {
                    row.map(
                        |(canonical_topic, aliases_json, blob, created_by, confidence, created_at)| {
                            AliasEntry {
                                canonical_topic,
                                aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
                                embedding: blob.map(|b| blob_to_vec(&b)),
                                created_by,
                                confidence,
                                created_at,
                            }
                        },
                    )
                })
            })
            .await
            .map_err(into_engram_error)
    }
}
