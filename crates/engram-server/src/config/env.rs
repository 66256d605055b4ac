// crates/engram-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;

use tracing::{debug, warn};

/// External endpoints loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    /// Router LM endpoint (ENGRAM_ROUTER_URL)
    pub router: Option<String>,
    /// Teacher LM endpoint (ENGRAM_TEACHER_URL)
    pub teacher: Option<String>,
    /// Embedding model endpoint (ENGRAM_EMBEDDINGS_URL)
    pub embeddings: Option<String>,
}

impl Endpoints {
    /// Load endpoints from environment variables.
    ///
    /// Set `ENGRAM_DISABLE_LLM=1` to suppress the LM endpoints (forces
    /// deterministic fallbacks; embeddings are unaffected).
    pub fn from_env() -> Self {
        if parse_bool_env("ENGRAM_DISABLE_LLM").unwrap_or(false) {
            debug!("ENGRAM_DISABLE_LLM is set; LM endpoints disabled, using fallbacks");
            return Self {
                router: None,
                teacher: None,
                embeddings: read_var("ENGRAM_EMBEDDINGS_URL"),
            };
        }

        let endpoints = Self {
            router: read_var("ENGRAM_ROUTER_URL"),
            teacher: read_var("ENGRAM_TEACHER_URL"),
            embeddings: read_var("ENGRAM_EMBEDDINGS_URL"),
        };
        endpoints.log_status();
        endpoints
    }

    /// Log which endpoints are available (without exposing values)
    fn log_status(&self) {
        let mut available = Vec::new();
        if self.router.is_some() {
            available.push("router");
        }
        if self.teacher.is_some() {
            available.push("teacher");
        }
        if self.embeddings.is_some() {
            available.push("embeddings");
        }

        if available.is_empty() {
            warn!("no external endpoints configured; routing falls back to patterns and chat");
        } else {
            debug!(endpoints = ?available, "external endpoints loaded");
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding per-project databases and the global alias table
    pub data_dir: PathBuf,
    /// Embedding dimension (vectors at rest and in the index)
    pub embedding_dim: usize,
    /// Per-call deadline for LM requests, seconds
    pub llm_timeout_secs: u64,
    /// Number of indexing workers
    pub index_workers: usize,
    /// Cosine-similarity threshold for canonicalization via embeddings
    pub similarity_threshold: f32,
    /// External endpoints
    pub endpoints: Endpoints,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("ENGRAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            embedding_dim: parse_env("ENGRAM_EMBEDDING_DIM").unwrap_or(1024),
            llm_timeout_secs: parse_env("ENGRAM_LLM_TIMEOUT_SECS").unwrap_or(30),
            index_workers: parse_env("ENGRAM_INDEX_WORKERS").unwrap_or(2),
            similarity_threshold: parse_env("ENGRAM_SIMILARITY_THRESHOLD").unwrap_or(0.92),
            endpoints: Endpoints::from_env(),
        }
    }

    /// Path to a project's database file.
    pub fn project_db_path(&self, project_id: &uuid::Uuid) -> PathBuf {
        self.data_dir.join("projects").join(format!("{project_id}.db"))
    }

    /// Path to the global alias table database.
    pub fn alias_db_path(&self) -> PathBuf {
        self.data_dir.join("alias_table.db")
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            embedding_dim: 1024,
            llm_timeout_secs: 30,
            index_workers: 2,
            similarity_threshold: 0.92,
            endpoints: Endpoints::default(),
        }
    }
}

/// Read an env var, filtering empty values.
fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an env var, returning None when unset or unparseable.
fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    read_var(name).and_then(|v| v.parse().ok())
}

/// Parse a boolean env var ("1", "true", "yes").
fn parse_bool_env(name: &str) -> Option<bool> {
    read_var(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}
