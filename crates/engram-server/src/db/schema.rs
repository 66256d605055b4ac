// crates/engram-server/src/db/schema.rs
// Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Run schema setup for a per-project database.
///
/// Called during pool creation. Idempotent: every statement uses
/// IF NOT EXISTS.
pub fn run_project_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(PROJECT_SCHEMA)?;
    Ok(())
}

/// Run schema setup for the global alias table database.
pub fn run_alias_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(ALIAS_SCHEMA)?;
    Ok(())
}

/// Per-project database schema.
///
/// One file per project: facts (temporally versioned), chat messages,
/// chunks, embedding blobs, and the project's linked file sources.
pub const PROJECT_SCHEMA: &str = r#"
-- =======================================
-- FACTS: temporally versioned assertions
-- =======================================
CREATE TABLE IF NOT EXISTS project_facts (
    id INTEGER PRIMARY KEY,
    fact_id TEXT UNIQUE NOT NULL,
    project_id TEXT NOT NULL,
    fact_key TEXT NOT NULL,
    value_text TEXT NOT NULL,
    value_type TEXT NOT NULL DEFAULT 'string',
    confidence REAL NOT NULL DEFAULT 1.0,
    source_message_uuid TEXT,
    created_at TEXT NOT NULL,
    effective_at TEXT NOT NULL,
    supersedes_fact_id TEXT,
    is_current INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_facts_current
    ON project_facts(project_id, fact_key, is_current);
CREATE INDEX IF NOT EXISTS idx_facts_scan
    ON project_facts(project_id, is_current, fact_key);

-- =======================================
-- CHAT MESSAGES (citation metadata only; the transcript store owns history)
-- =======================================
CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY,
    message_uuid TEXT UNIQUE NOT NULL,
    project_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    UNIQUE(chat_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON chat_messages(chat_id, message_index);

-- =======================================
-- CHUNKS & EMBEDDINGS
-- =======================================
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    source_id TEXT NOT NULL,
    message_uuid TEXT,
    chat_id TEXT,
    file_path TEXT,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    start_char INTEGER NOT NULL,
    end_char INTEGER NOT NULL,
    fingerprint TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id);
CREATE INDEX IF NOT EXISTS idx_chunks_message ON chunks(message_uuid);

-- Embeddings at rest: raw little-endian float32 blobs
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY,
    chunk_id INTEGER NOT NULL REFERENCES chunks(id),
    embedding BLOB NOT NULL,
    model_name TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE(chunk_id, model_name)
);
CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id);

-- =======================================
-- LINKED FILE SOURCES (cross-project sharing via explicit linkage)
-- =======================================
CREATE TABLE IF NOT EXISTS linked_sources (
    source_id TEXT PRIMARY KEY,
    linked_at TEXT NOT NULL
);
"#;

/// Global alias table schema: canonical topics, their aliases, and the
/// canonical's embedding.
pub const ALIAS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS alias_entries (
    canonical_topic TEXT PRIMARY KEY,
    aliases_json TEXT NOT NULL,
    embedding BLOB,
    created_by TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_schema_applies() {
        let conn = Connection::open_in_memory().expect("open");
        run_project_migrations(&conn).expect("migrate");
        // Re-running must be a no-op
        run_project_migrations(&conn).expect("migrate twice");

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
                 ('project_facts', 'chat_messages', 'chunks', 'embeddings', 'linked_sources')",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 5);
    }

    #[test]
    fn test_alias_schema_applies() {
        let conn = Connection::open_in_memory().expect("open");
        run_alias_migrations(&conn).expect("migrate");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='alias_entries'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 1);
    }
}
