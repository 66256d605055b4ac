// crates/engram-server/src/canon/mod.rs
// Canonicalizer: raw topic strings -> canonical topics
//
// Cascade: normalize, alias table (authoritative), embedding similarity,
// teacher model, verbatim fallback. The written alias entry makes every
// later call for the same expression resolve at the alias step, so the
// teacher is invoked at most once per expression per table state.

pub mod alias;

pub use alias::{AliasEntry, AliasMatch, AliasTable};

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::embeddings::{cosine_similarity_unit, EmbeddingClient};
use crate::llm::TeacherClient;

static FAVORITE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfavorites?\s*[-_\s]*").expect("static regex"));
static MY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^my\s*[-_\s]*").expect("static regex"));

/// Where a canonicalization came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonSource {
    AliasTable,
    Embedding,
    Teacher,
    Fallback,
}

/// Result of the canonicalization cascade.
#[derive(Debug, Clone)]
pub struct Canonicalization {
    pub canonical_topic: String,
    pub confidence: f32,
    pub source: CanonSource,
    pub teacher_invoked: bool,
    pub raw_topic: String,
}

/// Topic canonicalizer used on both the facts write and read paths.
pub struct Canonicalizer {
    alias_table: Arc<AliasTable>,
    embedder: Option<Arc<EmbeddingClient>>,
    teacher: Option<Arc<TeacherClient>>,
    similarity_threshold: f32,
}

impl Canonicalizer {
    pub fn new(
        alias_table: Arc<AliasTable>,
        embedder: Option<Arc<EmbeddingClient>>,
        teacher: Option<Arc<TeacherClient>>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            alias_table,
            embedder,
            teacher,
            similarity_threshold,
        }
    }

    pub fn alias_table(&self) -> &Arc<AliasTable> {
        &self.alias_table
    }

    /// Basic string normalization: lowercase, trim, drop "my" and
    /// "favorite(s)" connectives. Always the first step of the cascade.
    pub fn normalize_topic(raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }
        let lowered = raw.to_lowercase();
        let without_favorite = FAVORITE_WORD.replace_all(&lowered, "");
        let without_my = MY_PREFIX.replace(without_favorite.trim(), "");
        without_my.trim().to_string()
    }

    /// Canonicalize a raw topic.
    ///
    /// Deterministic for a fixed alias table state: steps 1-3 are pure
    /// lookups; the teacher (step 4) writes its decision into the table
    /// so subsequent calls short-circuit at the alias step.
    pub async fn canonicalize(&self, raw_topic: &str, invoke_teacher: bool) -> Canonicalization {
        let fallback = |canonical: String, confidence: f32| Canonicalization {
            canonical_topic: canonical,
            confidence,
            source: CanonSource::Fallback,
            teacher_invoked: false,
            raw_topic: raw_topic.to_string(),
        };

        if raw_topic.trim().is_empty() {
            return fallback("unknown".to_string(), 0.0);
        }

        let normalized = Self::normalize_topic(raw_topic);
        if normalized.is_empty() {
            return fallback("unknown".to_string(), 0.0);
        }

        // Step 2: alias table (authoritative)
        match self.alias_table.find_canonical(&normalized).await {
            Ok(Some(matched)) => {
                tracing::debug!(
                    "Alias table match: '{}' -> '{}' (via '{}')",
                    raw_topic,
                    matched.canonical_topic,
                    matched.matched_alias
                );
                return Canonicalization {
                    canonical_topic: matched.canonical_topic,
                    confidence: 1.0,
                    source: CanonSource::AliasTable,
                    teacher_invoked: false,
                    raw_topic: raw_topic.to_string(),
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Alias table lookup failed: {}", e);
            }
        }

        // Step 3: embedding similarity against known canonical topics
        if let Some(embedder) = &self.embedder {
            match self.canonicalize_via_embedding(embedder, &normalized).await {
                Ok(Some((canonical, similarity))) if similarity >= self.similarity_threshold => {
                    tracing::debug!(
                        "Embedding match: '{}' -> '{}' (similarity {:.3})",
                        raw_topic,
                        canonical,
                        similarity
                    );
                    return Canonicalization {
                        canonical_topic: canonical,
                        confidence: similarity,
                        source: CanonSource::Embedding,
                        teacher_invoked: false,
                        raw_topic: raw_topic.to_string(),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Embedding canonicalization failed: {}", e);
                }
            }
        }

        // Step 4: teacher, for low-confidence expressions
        if invoke_teacher {
            if let Some(result) = self.canonicalize_via_teacher(raw_topic, &normalized).await {
                return result;
            }
        }

        tracing::warn!(
            "No canonical match for '{}', using normalized fallback",
            raw_topic
        );
        fallback(normalized, 0.5)
    }

    async fn canonicalize_via_embedding(
        &self,
        embedder: &Arc<EmbeddingClient>,
        normalized_topic: &str,
    ) -> crate::Result<Option<(String, f32)>> {
        let canonical_topics = self.alias_table.all_canonical_topics().await?;
        if canonical_topics.is_empty() {
            return Ok(None);
        }

        let topic_embedding = embedder
            .embed_query(normalized_topic)
            .await
            .map_err(|e| crate::EngramError::Embedding(e.to_string()))?;

        let mut best: Option<(String, f32)> = None;
        for (canonical, embedding) in canonical_topics {
            let Some(embedding) = embedding else { continue };
            let similarity = cosine_similarity_unit(&topic_embedding, &embedding);
            if best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true) {
                best = Some((canonical, similarity));
            }
        }
        Ok(best)
    }

    async fn canonicalize_via_teacher(
        &self,
        raw_topic: &str,
        normalized_topic: &str,
    ) -> Option<Canonicalization> {
        let teacher = self.teacher.as_ref()?;
        tracing::info!("Invoking teacher for low-confidence topic: '{}'", raw_topic);

        let decision = match teacher.canonicalize_topic(raw_topic, normalized_topic).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("Teacher invocation failed: {}", e);
                return None;
            }
        };

        let canonical_embedding = match &self.embedder {
            Some(embedder) => match embedder.embed_query(&decision.canonical_topic).await {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    tracing::warn!("Failed to embed canonical topic: {}", e);
                    None
                }
            },
            None => None,
        };

        // Persist the decision so later calls resolve at the alias step.
        // The normalized expression is added as an alias even if the
        // teacher omitted it.
        let mut aliases = decision.aliases.clone();
        if !aliases.iter().any(|a| a.eq_ignore_ascii_case(normalized_topic)) {
            aliases.push(normalized_topic.to_string());
        }
        if let Err(e) = self
            .alias_table
            .add_entry(
                &decision.canonical_topic,
                aliases,
                canonical_embedding,
                "teacher",
                1.0,
            )
            .await
        {
            tracing::error!("Failed to persist teacher decision: {}", e);
        }

        Some(Canonicalization {
            canonical_topic: decision.canonical_topic,
            confidence: 1.0,
            source: CanonSource::Teacher,
            teacher_invoked: true,
            raw_topic: raw_topic.to_string(),
        })
    }
}
