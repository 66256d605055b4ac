// crates/engram-types/src/lib.rs

//! Shared data contracts between the Engram server and its clients.
//!
//! This crate provides the wire-level types for:
//! - **Routing plans**: the strict schema the router model must produce
//! - **Facts operations**: the write-side operation taxonomy
//! - **Query plans**: the deterministic read-side plans
//! - **Apply results / answers**: the structured outcomes of both paths
//!
//! These types carry no native-only dependencies; everything here is
//! `serde` in and `serde` out.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ===================================================
// ROUTING PLAN
// ===================================================

/// Content plane a message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentPlane {
    Facts,
    Index,
    Files,
    Chat,
}

/// Operation within a content plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Write,
    Read,
    Search,
    None,
}

/// A fact value as extracted by the router: a single string or an
/// ordered list of strings ("My favorite colors are red, white, blue").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    One(String),
    Many(Vec<String>),
}

impl FactValue {
    /// Flatten into an ordered list of values.
    pub fn into_values(self) -> Vec<String> {
        match self {
            FactValue::One(v) => vec![v],
            FactValue::Many(vs) => vs,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FactValue::One(_) => 1,
            FactValue::Many(vs) => vs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FactValue::One(v) => v.is_empty(),
            FactValue::Many(vs) => vs.is_empty(),
        }
    }
}

/// A requested rank in an ordinal query.
///
/// `Last` is a dispatcher-side sentinel ("my last favorite ...") that is
/// resolved to the list's maximum available rank before execution; the
/// router model itself only ever produces numeric ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankSpec {
    #[serde(rename = "last")]
    Last,
    #[serde(untagged)]
    Nth(u32),
}

/// Extracted fact candidate for facts/write operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsWriteCandidate {
    /// Topic word as the user said it (e.g. "cryptos", "colors").
    pub topic: String,
    /// The value(s) being asserted, in user order.
    pub value: FactValue,
    /// Whether the values are rank-ordered (true for bulk statements).
    pub rank_ordered: bool,
    /// Explicit rank directive ("My #2 favorite ..."), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

/// Extracted query candidate for facts/read operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsReadCandidate {
    /// Topic to query (e.g. "candy", "crypto").
    pub topic: String,
    /// Original query text, kept for context and planning.
    pub query: String,
    /// Ordinal rank requested, if the query is an ordinal query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<RankSpec>,
}

/// Extracted query candidate for index search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCandidate {
    pub query: String,
}

/// Extracted query candidate for file operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesCandidate {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_hint: Option<String>,
}

/// The plane-specific payload of a routing plan.
///
/// Using a sum type (rather than four optional fields) makes an
/// inconsistent plan (e.g. a facts/write plan carrying an index
/// candidate) unrepresentable after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanCandidate {
    FactsWrite(FactsWriteCandidate),
    FactsRead(FactsReadCandidate),
    Index(IndexCandidate),
    Files(FilesCandidate),
    None,
}

/// Where a routing plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    /// Produced by the deterministic pattern matcher, bypassing the model.
    Override,
    /// Produced by the router model and validated.
    Model,
    /// Fallback plan after the router model failed.
    Fallback,
}

/// A validated routing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub content_plane: ContentPlane,
    pub operation: Operation,
    pub reasoning_required: bool,
    pub candidate: PlanCandidate,
    pub confidence: f32,
    pub why: String,
    pub source: RouteSource,
}

impl RoutingPlan {
    /// The fallback plan used when routing fails entirely.
    pub fn chat_fallback(why: impl Into<String>) -> Self {
        Self {
            content_plane: ContentPlane::Chat,
            operation: Operation::None,
            reasoning_required: true,
            candidate: PlanCandidate::None,
            confidence: 0.0,
            why: why.into(),
            source: RouteSource::Fallback,
        }
    }
}

/// Validation failure for a raw routing plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError(pub String);

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid routing plan: {}", self.0)
    }
}

impl std::error::Error for PlanError {}

/// Maximum rank the router may request on the read path.
pub const MAX_READ_RANK: u32 = 10;

/// The permissive wire form of a routing plan, as the router model emits
/// it. `validate()` turns it into a [`RoutingPlan`] or rejects it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPlanWire {
    pub content_plane: Option<ContentPlane>,
    pub operation: Option<Operation>,
    #[serde(default)]
    pub reasoning_required: bool,
    #[serde(default)]
    pub facts_write_candidate: Option<FactsWriteCandidate>,
    #[serde(default)]
    pub facts_read_candidate: Option<FactsReadCandidateWire>,
    #[serde(default)]
    pub index_candidate: Option<IndexCandidate>,
    #[serde(default)]
    pub files_candidate: Option<FilesCandidate>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub why: Option<String>,
}

/// Wire form of a read candidate; the model only produces numeric ranks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsReadCandidateWire {
    pub topic: String,
    pub query: String,
    #[serde(default)]
    pub rank: Option<u32>,
}

impl RoutingPlanWire {
    /// Validate the wire plan and map it into the typed form.
    ///
    /// Enforces plane/candidate agreement, confidence bounds, and the
    /// read-path rank bound of [`MAX_READ_RANK`].
    pub fn validate(self) -> Result<RoutingPlan, PlanError> {
        let content_plane = self
            .content_plane
            .ok_or_else(|| PlanError("missing content_plane".into()))?;
        let operation = self
            .operation
            .ok_or_else(|| PlanError("missing operation".into()))?;

        let confidence = self.confidence.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PlanError(format!(
                "confidence {confidence} outside [0.0, 1.0]"
            )));
        }

        let candidate = match (content_plane, operation) {
            (ContentPlane::Facts, Operation::Write) => {
                let c = self
                    .facts_write_candidate
                    .ok_or_else(|| PlanError("facts/write requires facts_write_candidate".into()))?;
                if c.topic.trim().is_empty() {
                    return Err(PlanError("facts_write_candidate.topic is empty".into()));
                }
                if c.value.is_empty() {
                    return Err(PlanError("facts_write_candidate.value is empty".into()));
                }
                if let Some(rank) = c.rank {
                    if rank < 1 {
                        return Err(PlanError(format!("write rank {rank} must be >= 1")));
                    }
                }
                PlanCandidate::FactsWrite(c)
            }
            (ContentPlane::Facts, Operation::Read) => {
                let c = self
                    .facts_read_candidate
                    .ok_or_else(|| PlanError("facts/read requires facts_read_candidate".into()))?;
                if c.topic.trim().is_empty() {
                    return Err(PlanError("facts_read_candidate.topic is empty".into()));
                }
                if let Some(rank) = c.rank {
                    if !(1..=MAX_READ_RANK).contains(&rank) {
                        return Err(PlanError(format!(
                            "read rank {rank} outside [1, {MAX_READ_RANK}]"
                        )));
                    }
                }
                PlanCandidate::FactsRead(FactsReadCandidate {
                    topic: c.topic,
                    query: c.query,
                    rank: c.rank.map(RankSpec::Nth),
                })
            }
            (ContentPlane::Index, Operation::Search) => {
                let c = self
                    .index_candidate
                    .ok_or_else(|| PlanError("index/search requires index_candidate".into()))?;
                PlanCandidate::Index(c)
            }
            (ContentPlane::Files, _) => {
                let c = self
                    .files_candidate
                    .ok_or_else(|| PlanError("files plane requires files_candidate".into()))?;
                PlanCandidate::Files(c)
            }
            (ContentPlane::Chat, _) => PlanCandidate::None,
            (plane, op) => {
                return Err(PlanError(format!(
                    "unsupported plane/operation combination: {plane:?}/{op:?}"
                )));
            }
        };

        Ok(RoutingPlan {
            content_plane,
            operation,
            reasoning_required: self.reasoning_required,
            candidate,
            confidence,
            why: self.why.unwrap_or_default(),
            source: RouteSource::Model,
        })
    }
}

// ===================================================
// FACTS OPERATIONS (write side)
// ===================================================

/// Operation kind for a single fact write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactsOpKind {
    /// Generic fact set (`fact_key` + `value`).
    Set,
    /// Set a ranked list item (`list_key` + optional `rank` + `value`).
    RankedListSet,
    /// Clear all ranks for a `list_key`. Reserved; rejected by the core.
    RankedListClear,
}

/// A single fact operation to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsOp {
    pub op: FactsOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl FactsOp {
    /// An unranked append to a ranked list.
    pub fn ranked_append(list_key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: FactsOpKind::RankedListSet,
            fact_key: None,
            list_key: Some(list_key.into()),
            rank: None,
            value: Some(value.into()),
            confidence: None,
        }
    }

    /// An explicit-rank write to a ranked list.
    pub fn ranked_set(list_key: impl Into<String>, rank: u32, value: impl Into<String>) -> Self {
        Self {
            op: FactsOpKind::RankedListSet,
            fact_key: None,
            list_key: Some(list_key.into()),
            rank: Some(rank),
            value: Some(value.into()),
            confidence: None,
        }
    }

    /// A generic fact set.
    pub fn set(fact_key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: FactsOpKind::Set,
            fact_key: Some(fact_key.into()),
            list_key: None,
            rank: None,
            value: Some(value.into()),
            confidence: None,
        }
    }
}

/// A batch of fact operations, applied atomically.
///
/// If `needs_clarification` is non-empty, no operations are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactsOpsResponse {
    #[serde(default)]
    pub ops: Vec<FactsOp>,
    #[serde(default)]
    pub needs_clarification: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl FactsOpsResponse {
    pub fn from_ops(ops: Vec<FactsOp>) -> Self {
        Self {
            ops,
            ..Default::default()
        }
    }
}

// ===================================================
// FACTS QUERY PLAN (read side)
// ===================================================

/// Query intent for facts retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    FactsGetRankedList,
    FactsGetByPrefix,
    FactsGetExactKey,
}

fn default_limit() -> usize {
    100
}

fn default_include_ranks() -> bool {
    true
}

/// A deterministic query plan for facts retrieval.
///
/// Storage is unbounded; `limit` only paginates list retrieval. Ordinal
/// queries (`rank` set) retrieve the list unbounded internally so the
/// requested rank is always reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsQueryPlan {
    pub intent: QueryIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_key: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_include_ranks")]
    pub include_ranks: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

impl FactsQueryPlan {
    /// A ranked-list plan for a topic.
    pub fn ranked_list(topic: impl Into<String>, rank: Option<u32>) -> Self {
        Self {
            intent: QueryIntent::FactsGetRankedList,
            list_key: None,
            topic: Some(topic.into()),
            key_prefix: None,
            fact_key: None,
            limit: default_limit(),
            include_ranks: true,
            rank,
        }
    }
}

// ===================================================
// APPLY RESULT
// ===================================================

/// How a rank was assigned during a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankSource {
    Explicit,
    AtomicAppend,
}

/// A duplicate append that was blocked, with the blocking rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateBlocked {
    pub existing_rank: u32,
    pub topic: String,
    pub list_key: String,
}

/// Outcome of an explicit-rank mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Move,
    Insert,
    Noop,
    Append,
}

/// Details of one explicit-rank mutation, for user-facing messaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankMutation {
    pub action: MutationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_rank: Option<u32>,
    pub new_rank: u32,
    pub value: String,
    pub topic: String,
}

/// Result of applying a batch of fact operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub store_count: usize,
    pub update_count: usize,
    #[serde(default)]
    pub stored_fact_keys: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// fact_key -> how its rank was assigned.
    #[serde(default)]
    pub rank_assignment_source: BTreeMap<String, RankSource>,
    /// value -> blocking info for duplicate appends.
    #[serde(default)]
    pub duplicate_blocked: BTreeMap<String, DuplicateBlocked>,
    /// fact_key -> mutation details for explicit-rank writes.
    #[serde(default)]
    pub rank_mutations: BTreeMap<String, RankMutation>,
}

impl ApplyResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ===================================================
// FACTS ANSWER
// ===================================================

/// Where an ordinal rank was detected, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrdinalSource {
    Router,
    Planner,
    None,
}

/// A single fact in an answer, with provenance for citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact_key: String,
    pub value_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Result of executing a facts query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactsAnswer {
    pub facts: Vec<FactRecord>,
    pub count: usize,
    pub canonical_keys: Vec<String>,
    pub rank_applied: bool,
    /// Whether the rank filter found results (`None` if rank not applied).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_result_found: Option<bool>,
    pub ordinal_parse_source: OrdinalSource,
    /// Maximum rank available for this topic, for bounds messaging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_available_rank: Option<u32>,
}

impl FactsAnswer {
    pub fn empty(ordinal_parse_source: OrdinalSource) -> Self {
        Self {
            facts: Vec::new(),
            count: 0,
            canonical_keys: Vec::new(),
            rank_applied: false,
            rank_result_found: None,
            ordinal_parse_source,
            max_available_rank: None,
        }
    }
}
