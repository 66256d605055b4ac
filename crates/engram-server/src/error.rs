// crates/engram-server/src/error.rs
// Standardized error types for Engram

use thiserror::Error;

/// Main error type for the Engram library
#[derive(Error, Debug)]
pub enum EngramError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("database busy: {0}")]
    Busy(String),

    #[error("router unavailable: {0}")]
    RouterUnavailable(String),

    #[error("router returned non-conforming plan: {0}")]
    RouterSchemaInvalid(String),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("indexing job timed out after {0:.1}s")]
    JobTimeout(f64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using EngramError
pub type Result<T> = std::result::Result<T, EngramError>;

impl From<String> for EngramError {
    fn from(s: String) -> Self {
        EngramError::Other(s)
    }
}

impl From<engram_types::PlanError> for EngramError {
    fn from(err: engram_types::PlanError) -> Self {
        EngramError::RouterSchemaInvalid(err.to_string())
    }
}

impl From<tokio::task::JoinError> for EngramError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngramError::Other(err.to_string())
    }
}

impl From<EngramError> for String {
    fn from(err: EngramError) -> Self {
        err.to_string()
    }
}
