// crates/engram-server/src/dispatch/mod.rs
// Dispatch outcome types and candidate-to-operation mapping
//
// The dispatcher itself lives on `Engram` (service.rs); this module holds
// the structured results it produces and the deterministic translation
// from routing candidates to fact operations.

use engram_types::{
    ApplyResult, FactsAnswer, FactsOp, FactsOpsResponse, FactsWriteCandidate, RoutingPlan,
};

use crate::index::SearchHit;

/// Marker for deterministic facts answers; responses carrying it never
/// came from a generative path.
pub const FAST_PATH_FACTS: &str = "facts_retrieval";

/// Result of dispatching one user message.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Stable UUID of the message, assigned synchronously before dispatch.
    pub message_uuid: String,
    /// The routing plan that drove the dispatch.
    pub plan: RoutingPlan,
    /// The plane's structured reply.
    pub reply: PlaneReply,
    /// Indexing job enqueued for this message, when indexing is enabled.
    pub indexing_job_id: Option<String>,
}

/// Structured reply from the executed plane.
#[derive(Debug)]
pub enum PlaneReply {
    /// Facts were written (or blocked as duplicates).
    FactsWrite(ApplyResult),
    /// A deterministic facts answer.
    FactsRead(FactsReadReply),
    /// Semantic search results (index or files plane).
    Search(SearchReply),
    /// Topic extraction failed; the caller should ask the user.
    Clarification(String),
    /// Plain chat: the generative model owns the response.
    Chat,
}

/// A deterministic facts-read answer with its enforcement flags.
#[derive(Debug)]
pub struct FactsReadReply {
    pub answer: FactsAnswer,
    pub canonical_topic: String,
    /// Always [`FAST_PATH_FACTS`]; deterministic reads never fall through
    /// to a generative path.
    pub fast_path: &'static str,
    /// The list was empty but the request was well-formed.
    pub facts_empty_valid: bool,
    /// An ordinal was requested beyond the list's length.
    pub out_of_range: bool,
    /// The rank the read actually executed with ("last" resolves here).
    pub resolved_rank: Option<u32>,
}

/// Semantic search results with citation metadata.
#[derive(Debug)]
pub struct SearchReply {
    pub hits: Vec<SearchHit>,
    /// True when the brute-force durable scan served the query because
    /// the in-memory index was empty or still rebuilding.
    pub used_fallback_scan: bool,
}

/// Translate a facts-write candidate into the operation batch to apply.
///
/// Bulk values become one transaction of unranked appends (so the append
/// rank computation sees earlier writes of the same statement). An
/// explicit rank directive applies to the first value; any further values
/// append after it.
pub fn ops_from_write_candidate(
    candidate: &FactsWriteCandidate,
    list_key: &str,
) -> FactsOpsResponse {
    let values = candidate.value.clone().into_values();
    let mut ops = Vec::with_capacity(values.len());

    let mut values = values.into_iter();
    if let Some(rank) = candidate.rank {
        if let Some(first) = values.next() {
            ops.push(FactsOp::ranked_set(list_key, rank, first));
        }
    }
    for value in values {
        ops.push(FactsOp::ranked_append(list_key, value));
    }

    FactsOpsResponse::from_ops(ops)
}
