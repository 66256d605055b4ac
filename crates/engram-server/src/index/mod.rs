// crates/engram-server/src/index/mod.rs
// Flat inner-product vector index with project scoping and soft deletes

pub mod rebuild;

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{EngramError, Result};

/// Batch size for index appends; a yield point sits between batches so
/// large rebuilds don't starve the runtime.
const ADD_BATCH_SIZE: usize = 1000;

/// Prefix marking chat-derived sources ("project-<uuid>"), which are
/// subject to strict project isolation.
pub const PROJECT_CHAT_PREFIX: &str = "project-";

/// Metadata bound to each vector in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMeta {
    pub embedding_id: i64,
    pub chunk_id: i64,
    pub source_id: String,
    pub project_id: String,
    pub chat_id: Option<String>,
    pub message_uuid: Option<String>,
    pub file_path: Option<String>,
    pub chunk_index: u32,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
}

/// A search result: score in [0, 1] plus the vector's metadata.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub meta: VectorMeta,
}

/// Filters applied to a search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// File sources explicitly linked to the querying project.
    pub source_ids: Option<Vec<String>>,
    /// Project scoping; chat sources must match this exactly.
    pub project_id: Option<String>,
    /// Chats to exclude (e.g. the current conversation).
    pub exclude_chat_ids: Option<Vec<String>>,
}

impl SearchFilter {
    fn is_filtered(&self) -> bool {
        self.source_ids.is_some() || self.project_id.is_some() || self.exclude_chat_ids.is_some()
    }
}

/// Project-isolation and source filtering for one candidate result.
///
/// - Chat sources (`source_id` starting with `project-`) must match the
///   filter project exactly; cross-project chat data is never returned.
/// - File sources pass when explicitly linked (`source_id` in
///   `filter_source_ids`), regardless of which project indexed them.
pub(crate) fn passes_filters(
    meta: &VectorMeta,
    filter_source_ids: Option<&[String]>,
    filter_project_id: Option<&str>,
    exclude_chat_ids: Option<&[String]>,
) -> bool {
    let is_chat_source = meta.source_id.starts_with(PROJECT_CHAT_PREFIX);

    if let Some(allowed) = filter_source_ids {
        // Chat embeddings always pass the source filter (cross-chat memory
        // within the project); file sources must be explicitly linked.
        if !is_chat_source && !allowed.iter().any(|s| s == &meta.source_id) {
            return false;
        }
    }

    if let Some(project_id) = filter_project_id {
        if is_chat_source && meta.project_id != project_id {
            return false;
        }
    }

    if let Some(excluded) = exclude_chat_ids {
        if let Some(chat_id) = &meta.chat_id {
            if excluded.iter().any(|c| c == chat_id) {
                return false;
            }
        }
    }

    true
}

struct IndexState {
    vectors: Vec<f32>, // flat, len = count * dimension
    metadata: Vec<VectorMeta>,
    active: Vec<bool>,
    slot_by_embedding_id: HashMap<i64, usize>,
}

impl IndexState {
    fn count(&self) -> usize {
        self.metadata.len()
    }
}

/// In-memory flat inner-product index.
///
/// Vectors are expected L2-normalized, so inner product equals cosine
/// similarity; scores are reported scaled to [0, 1]. Deletion is soft:
/// slots are marked inactive and filtered at query time, never freed.
pub struct VectorIndex {
    dimension: usize,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(IndexState {
                vectors: Vec::new(),
                metadata: Vec::new(),
                active: Vec::new(),
                slot_by_embedding_id: HashMap::new(),
            }),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of vector slots (including inactive).
    pub async fn len(&self) -> usize {
        self.state.read().await.count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of active (non-deleted) vectors.
    pub async fn active_count(&self) -> usize {
        let state = self.state.read().await;
        state.active.iter().filter(|a| **a).count()
    }

    /// Append vectors with their metadata.
    ///
    /// Rejects dimension mismatches and non-finite entries (NaN/Inf). A
    /// vector whose `embedding_id` is already present deactivates the old
    /// slot first, so re-adds behave as updates. Input is processed in
    /// batches of 1000 with a yield point between batches.
    pub async fn add(&self, vectors: &[Vec<f32>], metadata: Vec<VectorMeta>) -> Result<usize> {
        if vectors.len() != metadata.len() {
            return Err(EngramError::InvalidInput(format!(
                "{} vectors but {} metadata entries",
                vectors.len(),
                metadata.len()
            )));
        }

        for (i, vector) in vectors.iter().enumerate() {
            if vector.len() != self.dimension {
                return Err(EngramError::InvalidInput(format!(
                    "vector {} has dimension {}, expected {}",
                    i,
                    vector.len(),
                    self.dimension
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(EngramError::InvalidInput(format!(
                    "vector {i} contains non-finite values"
                )));
            }
        }

        let mut added = 0;
        for (batch_vectors, batch_meta) in vectors
            .chunks(ADD_BATCH_SIZE)
            .zip(metadata.chunks(ADD_BATCH_SIZE))
        {
            {
                let mut state = self.state.write().await;
                for (vector, meta) in batch_vectors.iter().zip(batch_meta) {
                    if let Some(old_slot) =
                        state.slot_by_embedding_id.get(&meta.embedding_id).copied()
                    {
                        state.active[old_slot] = false;
                    }
                    let slot = state.count();
                    state.vectors.extend_from_slice(vector);
                    state.metadata.push(meta.clone());
                    state.active.push(true);
                    state.slot_by_embedding_id.insert(meta.embedding_id, slot);
                    added += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        tracing::debug!("Added {} vectors to index", added);
        Ok(added)
    }

    /// Soft-delete vectors by embedding id. Slots stay allocated and are
    /// filtered out of search results.
    pub async fn soft_delete(&self, embedding_ids: &[i64]) -> usize {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for id in embedding_ids {
            if let Some(slot) = state.slot_by_embedding_id.get(id).copied() {
                if state.active[slot] {
                    state.active[slot] = false;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!("Soft-deleted {} vectors", removed);
        }
        removed
    }

    /// Top-k nearest-neighbor search.
    ///
    /// When filters are present, `top_k × 3` raw candidates are ranked
    /// first, then inactive and filtered entries are dropped and the
    /// remainder truncated to `top_k`.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(EngramError::InvalidInput(format!(
                "query has dimension {}, expected {}",
                query.len(),
                self.dimension
            )));
        }

        let state = self.state.read().await;
        let count = state.count();
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, usize)> = Vec::with_capacity(count);
        for slot in 0..count {
            let offset = slot * self.dimension;
            let ip: f32 = state.vectors[offset..offset + self.dimension]
                .iter()
                .zip(query.iter())
                .map(|(a, b)| a * b)
                .sum();
            scored.push((ip, slot));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let search_k = if filter.is_filtered() {
            (top_k * 3).min(count)
        } else {
            top_k.min(count)
        };

        let mut results = Vec::with_capacity(top_k);
        for &(ip, slot) in scored.iter().take(search_k) {
            if !state.active[slot] {
                continue;
            }
            let meta = &state.metadata[slot];
            if !passes_filters(
                meta,
                filter.source_ids.as_deref(),
                filter.project_id.as_deref(),
                filter.exclude_chat_ids.as_deref(),
            ) {
                continue;
            }
            results.push(SearchHit {
                score: (ip + 1.0) / 2.0,
                meta: meta.clone(),
            });
            if results.len() >= top_k {
                break;
            }
        }
        Ok(results)
    }

    /// Reset all state; used for a full rebuild.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.vectors.clear();
        state.metadata.clear();
        state.active.clear();
        state.slot_by_embedding_id.clear();
        tracing::info!("Cleared vector index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(embedding_id: i64, source_id: &str, project_id: &str) -> VectorMeta {
        VectorMeta {
            embedding_id,
            chunk_id: embedding_id,
            source_id: source_id.to_string(),
            project_id: project_id.to_string(),
            chat_id: None,
            message_uuid: None,
            file_path: None,
            chunk_index: 0,
            start_char: 0,
            end_char: 0,
            text: format!("chunk {embedding_id}"),
        }
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let index = VectorIndex::new(3);
        index
            .add(
                &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
                vec![meta(1, "project-a", "a"), meta(2, "project-a", "a")],
            )
            .await
            .expect("add");

        let hits = index
            .search(&[1.0, 0.0, 0.0], 1, &SearchFilter::default())
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.embedding_id, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rejects_dimension_mismatch_and_nan() {
        let index = VectorIndex::new(3);
        let err = index
            .add(&[vec![1.0, 0.0]], vec![meta(1, "s", "p")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));

        let err = index
            .add(&[vec![f32::NAN, 0.0, 0.0]], vec![meta(1, "s", "p")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_soft_delete_filters_results() {
        let index = VectorIndex::new(2);
        index
            .add(&[vec![1.0, 0.0]], vec![meta(7, "project-a", "a")])
            .await
            .expect("add");
        assert_eq!(index.soft_delete(&[7]).await, 1);
        let hits = index
            .search(&[1.0, 0.0], 5, &SearchFilter::default())
            .await
            .expect("search");
        assert!(hits.is_empty());
        // Slot is not freed
        assert_eq!(index.len().await, 1);
        assert_eq!(index.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_re_add_same_embedding_id_updates() {
        let index = VectorIndex::new(2);
        index
            .add(&[vec![1.0, 0.0]], vec![meta(1, "project-a", "a")])
            .await
            .expect("add");
        index
            .add(&[vec![0.0, 1.0]], vec![meta(1, "project-a", "a")])
            .await
            .expect("re-add");

        let hits = index
            .search(&[0.0, 1.0], 5, &SearchFilter::default())
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_chat_sources_are_project_isolated() {
        let index = VectorIndex::new(2);
        index
            .add(
                &[vec![1.0, 0.0], vec![1.0, 0.0]],
                vec![meta(1, "project-a", "a"), meta(2, "project-b", "b")],
            )
            .await
            .expect("add");

        let filter = SearchFilter {
            project_id: Some("a".to_string()),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &filter).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.project_id, "a");
    }

    #[tokio::test]
    async fn test_file_sources_shared_via_linkage() {
        let index = VectorIndex::new(2);
        // A file corpus indexed under project b, linked into project a
        index
            .add(&[vec![1.0, 0.0]], vec![meta(1, "docs-corpus", "b")])
            .await
            .expect("add");

        let linked = SearchFilter {
            source_ids: Some(vec!["docs-corpus".to_string()]),
            project_id: Some("a".to_string()),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &linked).await.expect("search");
        assert_eq!(hits.len(), 1);

        let unlinked = SearchFilter {
            source_ids: Some(vec!["other-corpus".to_string()]),
            project_id: Some("a".to_string()),
            ..Default::default()
        };
        let hits = index
            .search(&[1.0, 0.0], 10, &unlinked)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_exclude_chat_ids() {
        let index = VectorIndex::new(2);
        let mut m = meta(1, "project-a", "a");
        m.chat_id = Some("chat-1".to_string());
        index.add(&[vec![1.0, 0.0]], vec![m]).await.expect("add");

        let filter = SearchFilter {
            exclude_chat_ids: Some(vec!["chat-1".to_string()]),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &filter).await.expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let index = VectorIndex::new(2);
        index
            .add(&[vec![1.0, 0.0]], vec![meta(1, "project-a", "a")])
            .await
            .expect("add");
        index.clear().await;
        assert!(index.is_empty().await);
    }
}
