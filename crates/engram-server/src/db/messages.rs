// crates/engram-server/src/db/messages.rs
// Chat message upsert, chunk/embedding persistence, brute-force scan fallback
//
// All functions here are synchronous and run inside `pool.interact()`
// closures on the blocking thread pool.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::embeddings::{blob_to_vec, vec_to_blob};
use crate::index::{SearchHit, VectorMeta};

/// A chat message row held for citation purposes.
#[derive(Debug, Clone)]
pub struct ChatMessageRecord {
    pub message_uuid: String,
    pub project_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_index: i64,
}

/// A chunk ready for persistence (before it has a row id).
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub source_id: String,
    pub message_uuid: Option<String>,
    pub chat_id: Option<String>,
    pub file_path: Option<String>,
    pub chunk_index: u32,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub fingerprint: String,
}

/// Upsert a chat message keyed on (chat_id, message_id) and return its
/// stable `message_uuid`.
///
/// The UUID never changes once assigned, so facts extracted from the same
/// message can cite it even while chunking/embedding is still pending.
pub fn upsert_chat_message(
    conn: &Connection,
    project_id: &str,
    chat_id: &str,
    message_id: &str,
    role: &str,
    content: &str,
    timestamp: DateTime<Utc>,
    message_index: i64,
) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT message_uuid FROM chat_messages WHERE chat_id = ?1 AND message_id = ?2",
            params![chat_id, message_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    if let Some(uuid) = existing {
        conn.execute(
            "UPDATE chat_messages SET content = ?1, timestamp = ?2, message_index = ?3 \
             WHERE chat_id = ?4 AND message_id = ?5",
            params![content, timestamp.to_rfc3339(), message_index, chat_id, message_id],
        )?;
        return Ok(uuid);
    }

    let message_uuid = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO chat_messages \
         (message_uuid, project_id, chat_id, message_id, role, content, timestamp, message_index) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message_uuid,
            project_id,
            chat_id,
            message_id,
            role,
            content,
            timestamp.to_rfc3339(),
            message_index
        ],
    )?;
    tracing::debug!("Upserted chat message {} in chat {}", message_uuid, chat_id);
    Ok(message_uuid)
}

/// Get a chat message by its UUID.
pub fn get_chat_message(conn: &Connection, message_uuid: &str) -> Result<Option<ChatMessageRecord>> {
    let row = conn
        .query_row(
            "SELECT message_uuid, project_id, chat_id, message_id, role, content, timestamp, message_index \
             FROM chat_messages WHERE message_uuid = ?1",
            params![message_uuid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(row.map(
        |(message_uuid, project_id, chat_id, message_id, role, content, timestamp, message_index)| {
            ChatMessageRecord {
                message_uuid,
                project_id,
                chat_id,
                message_id,
                role,
                content,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                message_index,
            }
        },
    ))
}

/// Persist chunks and their embeddings in one pass.
///
/// Returns `(chunk_id, embedding_id)` pairs in input order. Chunks and
/// embeddings must be the same length.
pub fn insert_chunks_with_embeddings(
    conn: &Connection,
    chunks: &[NewChunk],
    embeddings: &[Vec<f32>],
    model_name: &str,
) -> Result<Vec<(i64, i64)>> {
    anyhow::ensure!(
        chunks.len() == embeddings.len(),
        "chunk/embedding count mismatch: {} vs {}",
        chunks.len(),
        embeddings.len()
    );

    let mut ids = Vec::with_capacity(chunks.len());
    for (chunk, embedding) in chunks.iter().zip(embeddings) {
        conn.execute(
            "INSERT INTO chunks \
             (source_id, message_uuid, chat_id, file_path, chunk_index, text, start_char, end_char, fingerprint) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                chunk.source_id,
                chunk.message_uuid,
                chunk.chat_id,
                chunk.file_path,
                chunk.chunk_index,
                chunk.text,
                chunk.start_char as i64,
                chunk.end_char as i64,
                chunk.fingerprint,
            ],
        )?;
        let chunk_id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO embeddings (chunk_id, embedding, model_name) VALUES (?1, ?2, ?3) \
             ON CONFLICT(chunk_id, model_name) DO UPDATE SET embedding = excluded.embedding, deleted = 0",
            params![chunk_id, vec_to_blob(embedding), model_name],
        )?;
        ids.push((chunk_id, conn.last_insert_rowid()));
    }
    Ok(ids)
}

/// Mark embeddings soft-deleted in the durable store.
pub fn soft_delete_embeddings(conn: &Connection, embedding_ids: &[i64]) -> Result<usize> {
    let mut count = 0;
    for id in embedding_ids {
        count += conn.execute("UPDATE embeddings SET deleted = 1 WHERE id = ?1", params![id])?;
    }
    Ok(count)
}

/// A durable embedding row joined with its chunk metadata.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub embedding_id: i64,
    pub vector: Vec<f32>,
    pub meta: VectorMeta,
}

/// Load all live embeddings for this project database, for index rebuild.
pub fn load_all_embeddings(
    conn: &Connection,
    project_id: &str,
    model_name: &str,
) -> Result<Vec<EmbeddingRow>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.embedding, c.id, c.source_id, c.message_uuid, c.chat_id, c.file_path, \
                c.chunk_index, c.start_char, c.end_char, c.text \
         FROM embeddings e JOIN chunks c ON e.chunk_id = c.id \
         WHERE e.model_name = ?1 AND e.deleted = 0",
    )?;
    let rows = stmt.query_map(params![model_name], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)?,
            row.get::<_, i64>(9)?,
            row.get::<_, String>(10)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (
            embedding_id,
            blob,
            chunk_id,
            source_id,
            message_uuid,
            chat_id,
            file_path,
            chunk_index,
            start_char,
            end_char,
            text,
        ) = row?;
        out.push(EmbeddingRow {
            embedding_id,
            vector: blob_to_vec(&blob),
            meta: VectorMeta {
                embedding_id,
                chunk_id,
                source_id,
                project_id: project_id.to_string(),
                chat_id,
                message_uuid,
                file_path,
                chunk_index: chunk_index as u32,
                start_char: start_char as usize,
                end_char: end_char as usize,
                text,
            },
        });
    }
    Ok(out)
}

/// Brute-force scan of the durable embedding table.
///
/// Fallback for when the in-memory index is unavailable or still
/// rebuilding; applies the same filtering semantics as the index search.
pub fn scan_embeddings(
    conn: &Connection,
    project_id: &str,
    query: &[f32],
    top_k: usize,
    filter_source_ids: Option<&[String]>,
    filter_project_id: Option<&str>,
    exclude_chat_ids: Option<&[String]>,
    model_name: &str,
) -> Result<Vec<SearchHit>> {
    let rows = load_all_embeddings(conn, project_id, model_name)?;

    let mut scored: Vec<(f32, VectorMeta)> = Vec::with_capacity(rows.len());
    for row in rows {
        if row.vector.len() != query.len() {
            continue;
        }
        let ip: f32 = row
            .vector
            .iter()
            .zip(query.iter())
            .map(|(a, b)| a * b)
            .sum();
        scored.push((ip, row.meta));
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut hits = Vec::new();
    for (ip, meta) in scored {
        if !crate::index::passes_filters(&meta, filter_source_ids, filter_project_id, exclude_chat_ids)
        {
            continue;
        }
        hits.push(SearchHit {
            score: (ip + 1.0) / 2.0,
            meta,
        });
        if hits.len() >= top_k {
            break;
        }
    }
    Ok(hits)
}

/// Link a file source into this project (enables cross-project sharing of
/// file corpora via explicit linkage).
pub fn link_source(conn: &Connection, source_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO linked_sources (source_id, linked_at) VALUES (?1, ?2)",
        params![source_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// All file sources linked into this project.
pub fn linked_sources(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT source_id FROM linked_sources ORDER BY source_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
