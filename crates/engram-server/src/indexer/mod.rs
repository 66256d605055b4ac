// crates/engram-server/src/indexer/mod.rs
// Async indexing pipeline: chunk, embed, persist, add to the vector index

pub mod chunking;
pub mod queue;

pub use queue::{IndexingQueue, JobState};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::messages::NewChunk;
use crate::db::{messages, ProjectDatabases};
use crate::embeddings::EmbeddingClient;
use crate::index::{VectorIndex, VectorMeta};
use crate::Result;

use self::chunking::{chunk_chat_message, chunk_fingerprint, dedup_chunks};

/// Shared context handed to indexing workers.
pub struct IndexerContext {
    pub databases: Arc<ProjectDatabases>,
    pub embedder: Arc<EmbeddingClient>,
    pub index: Arc<VectorIndex>,
}

/// Parameters of one message-indexing job.
#[derive(Debug, Clone)]
pub struct MessageJob {
    pub project_id: Uuid,
    pub chat_id: String,
    pub message_id: String,
    pub message_uuid: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_index: i64,
}

/// Chunk, embed, persist and index one chat message.
///
/// The message row itself was upserted synchronously before enqueue; this
/// only adds chunks and embeddings. Returns the number of chunks indexed.
pub async fn index_chat_message(ctx: &IndexerContext, job: &MessageJob) -> Result<usize> {
    let chunks = dedup_chunks(chunk_chat_message(&job.content));
    if chunks.is_empty() {
        tracing::debug!(
            "Message {} produced no indexable chunks",
            job.message_uuid
        );
        return Ok(0);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx
        .embedder
        .embed_texts(&texts)
        .await
        .map_err(|e| crate::EngramError::Embedding(e.to_string()))?;

    let source_id = format!("project-{}", job.project_id);
    let new_chunks: Vec<NewChunk> = chunks
        .iter()
        .map(|chunk| NewChunk {
            source_id: source_id.clone(),
            message_uuid: Some(job.message_uuid.clone()),
            chat_id: Some(job.chat_id.clone()),
            file_path: None,
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            fingerprint: chunk_fingerprint(&chunk.text),
        })
        .collect();

    let pool = ctx.databases.get(&job.project_id).await?;
    let model_name = ctx.embedder.model_name().to_string();
    let persisted_chunks = new_chunks.clone();
    let persisted_vectors = vectors.clone();
    let ids = pool
        .interact(move |conn| {
            messages::insert_chunks_with_embeddings(
                conn,
                &persisted_chunks,
                &persisted_vectors,
                &model_name,
            )
        })
        .await
        .map_err(crate::facts::store::into_engram_error)?;

    let project_id = job.project_id.to_string();
    let metadata: Vec<VectorMeta> = new_chunks
        .iter()
        .zip(&ids)
        .map(|(chunk, (chunk_id, embedding_id))| VectorMeta {
            embedding_id: *embedding_id,
            chunk_id: *chunk_id,
            source_id: chunk.source_id.clone(),
            project_id: project_id.clone(),
            chat_id: chunk.chat_id.clone(),
            message_uuid: chunk.message_uuid.clone(),
            file_path: None,
            chunk_index: chunk.chunk_index,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            text: chunk.text.clone(),
        })
        .collect();
    ctx.index.add(&vectors, metadata).await?;

    tracing::debug!(
        "Indexed {} chunks for message {}",
        new_chunks.len(),
        job.message_uuid
    );
    Ok(new_chunks.len())
}

/// Chunk, embed, persist and index one file document under a file source.
///
/// File sources are shareable across projects via explicit linkage; the
/// chunks land in the indexing project's database and carry the source id
/// they were indexed under.
pub async fn index_file_document(
    ctx: &IndexerContext,
    project_id: &Uuid,
    source_id: &str,
    file_path: &str,
    text: &str,
) -> Result<usize> {
    let chunks = dedup_chunks(chunk_chat_message(text));
    if chunks.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx
        .embedder
        .embed_texts(&texts)
        .await
        .map_err(|e| crate::EngramError::Embedding(e.to_string()))?;

    let new_chunks: Vec<NewChunk> = chunks
        .iter()
        .map(|chunk| NewChunk {
            source_id: source_id.to_string(),
            message_uuid: None,
            chat_id: None,
            file_path: Some(file_path.to_string()),
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            fingerprint: chunk_fingerprint(&chunk.text),
        })
        .collect();

    let pool = ctx.databases.get(project_id).await?;
    let model_name = ctx.embedder.model_name().to_string();
    let persisted_chunks = new_chunks.clone();
    let persisted_vectors = vectors.clone();
    let ids = pool
        .interact(move |conn| {
            messages::insert_chunks_with_embeddings(
                conn,
                &persisted_chunks,
                &persisted_vectors,
                &model_name,
            )
        })
        .await
        .map_err(crate::facts::store::into_engram_error)?;

    let project = project_id.to_string();
    let metadata: Vec<VectorMeta> = new_chunks
        .iter()
        .zip(&ids)
        .map(|(chunk, (chunk_id, embedding_id))| VectorMeta {
            embedding_id: *embedding_id,
            chunk_id: *chunk_id,
            source_id: chunk.source_id.clone(),
            project_id: project.clone(),
            chat_id: None,
            message_uuid: None,
            file_path: chunk.file_path.clone(),
            chunk_index: chunk.chunk_index,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            text: chunk.text.clone(),
        })
        .collect();
    ctx.index.add(&vectors, metadata).await?;

    tracing::debug!("Indexed {} chunks for file {}", new_chunks.len(), file_path);
    Ok(new_chunks.len())
}
