// crates/engram-server/src/embeddings/mod.rs
// Embedding provider module

mod http;

pub use self::http::HttpEmbeddings;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::config::ServiceConfig;

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    Http(HttpEmbeddings),
    Deterministic(DeterministicEmbeddings),
}

/// Embedding client wrapping the configured backend.
///
/// All vectors leave this client L2-normalized, so inner product equals
/// cosine similarity downstream.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Provider identifier for change detection and model_name columns.
    pub fn model_name(&self) -> &str {
        match &self.backend {
            EmbeddingBackend::Http(c) => c.model_name(),
            EmbeddingBackend::Deterministic(_) => "deterministic",
        }
    }

    /// Create a client from pre-loaded configuration.
    ///
    /// Returns None when no embedding endpoint is configured.
    pub fn from_config(config: &ServiceConfig) -> Option<Self> {
        let endpoint = config.endpoints.embeddings.as_ref()?;
        tracing::info!(endpoint = %endpoint, dim = config.embedding_dim, "Using HTTP embeddings");
        Some(Self {
            backend: EmbeddingBackend::Http(HttpEmbeddings::new(
                endpoint.clone(),
                config.embedding_dim,
                config.llm_timeout_secs,
            )),
        })
    }

    /// A fully deterministic in-process backend.
    ///
    /// Token-hash embeddings: stable across runs and machines. Used by
    /// tests and by offline tooling that only needs consistent geometry,
    /// not semantic quality.
    pub fn deterministic(dimension: usize) -> Self {
        Self {
            backend: EmbeddingBackend::Deterministic(DeterministicEmbeddings { dimension }),
        }
    }

    /// Embedding dimensions.
    pub fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::Http(c) => c.dimensions(),
            EmbeddingBackend::Deterministic(c) => c.dimension,
        }
    }

    /// Embed a single query string. The result is L2-normalized.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = match &self.backend {
            EmbeddingBackend::Http(c) => c.embed(text).await?,
            EmbeddingBackend::Deterministic(c) => c.embed(text),
        };
        l2_normalize(&mut vector);
        Ok(vector)
    }

    /// Embed multiple texts in batch. Every result is L2-normalized.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = match &self.backend {
            EmbeddingBackend::Http(c) => c.embed_batch(texts).await?,
            EmbeddingBackend::Deterministic(c) => {
                texts.iter().map(|t| c.embed(t)).collect()
            }
        };
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// Token-hash embedding backend (deterministic, offline).
struct DeterministicEmbeddings {
    dimension: usize,
}

impl DeterministicEmbeddings {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        if vector.iter().all(|v| *v == 0.0) && self.dimension > 0 {
            // Empty input still needs a valid direction
            vector[0] = 1.0;
        }
        vector
    }
}

/// L2-normalize a vector in place. Zero vectors are left unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two vectors, normalized to [0, 1].
pub fn cosine_similarity_unit(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a * norm_b);
    (cosine + 1.0) / 2.0
}

/// Serialize a vector as raw little-endian f32 bytes (the at-rest format).
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Deserialize raw little-endian f32 bytes back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let vector = vec![1.0f32, -0.5, 0.25, 3.75];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)), vector);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0f32, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity_unit_range() {
        let a = vec![1.0f32, 0.0];
        assert!((cosine_similarity_unit(&a, &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity_unit(&a, &[-1.0, 0.0]) - 0.0).abs() < 1e-6);
        assert!((cosine_similarity_unit(&a, &[0.0, 1.0]) - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_deterministic_embeddings_are_stable() {
        let client = EmbeddingClient::deterministic(64);
        let a = client.embed_query("my favorite crypto").await.unwrap();
        let b = client.embed_query("my favorite crypto").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_deterministic_embeddings_differ_by_text() {
        let client = EmbeddingClient::deterministic(64);
        let a = client.embed_query("crypto").await.unwrap();
        let b = client.embed_query("vacation destinations").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_embed_texts_batch() {
        let client = EmbeddingClient::deterministic(32);
        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = client.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 32);
    }
}
