// tests/common/mod.rs
// Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use engram::config::ServiceConfig;
use engram::dispatch::{DispatchOutcome, FactsReadReply, PlaneReply};
use engram::embeddings::EmbeddingClient;
use engram::llm::ChatModel;
use engram::{Engram, EngramError};
use engram_types::ApplyResult;
use uuid::Uuid;

/// A deterministic teacher fake: canonicalizes by singularizing the
/// normalized expression (strip one trailing 's'), listing the raw
/// expression as an alias.
pub struct SingularizingTeacher;

#[async_trait]
impl ChatModel for SingularizingTeacher {
    async fn complete_json(&self, _system: &str, user: &str) -> engram::Result<String> {
        let normalized = user
            .lines()
            .find_map(|line| line.strip_prefix("Normalized: "))
            .unwrap_or("unknown")
            .trim()
            .to_string();
        let canonical = if normalized.ends_with('s') && !normalized.ends_with("ss") {
            normalized[..normalized.len() - 1].to_string()
        } else {
            normalized.clone()
        };
        Ok(serde_json::json!({
            "canonical_topic": canonical,
            "aliases": [normalized],
        })
        .to_string())
    }
}

/// A model that must never be consulted; fails the test if it is.
pub struct ForbiddenModel(pub &'static str);

#[async_trait]
impl ChatModel for ForbiddenModel {
    async fn complete_json(&self, _system: &str, _user: &str) -> engram::Result<String> {
        panic!("{} model must not be invoked for this flow", self.0);
    }
}

/// A scripted model returning canned responses in order, erroring when
/// the script runs dry.
pub struct ScriptedModel {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete_json(&self, _system: &str, _user: &str) -> engram::Result<String> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(EngramError::Llm("script exhausted".into()));
        }
        Ok(responses.remove(0))
    }
}

/// An Engram instance wired with deterministic fakes and a message
/// counter for unique message ids.
pub struct TestHarness {
    pub engram: Engram,
    pub project: Uuid,
    counter: AtomicUsize,
}

impl TestHarness {
    /// Standard harness: deterministic embedder + singularizing teacher,
    /// no router model (the deterministic override handles the strong
    /// patterns; everything else is chat).
    pub async fn new() -> Self {
        let engram = Engram::builder(ServiceConfig::default())
            .in_memory()
            .teacher_model(Arc::new(SingularizingTeacher))
            .embedder(Arc::new(EmbeddingClient::deterministic(64)))
            .build()
            .await
            .expect("build engram");
        Self {
            engram,
            project: Uuid::new_v4(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Wrap an already-built Engram instance.
    pub fn wrap(engram: Engram) -> Self {
        Self {
            engram,
            project: Uuid::new_v4(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Harness with a custom router model.
    pub async fn with_router(model: Arc<dyn ChatModel>) -> Self {
        let engram = Engram::builder(ServiceConfig::default())
            .in_memory()
            .router_model(model)
            .teacher_model(Arc::new(SingularizingTeacher))
            .embedder(Arc::new(EmbeddingClient::deterministic(64)))
            .build()
            .await
            .expect("build engram");
        Self {
            engram,
            project: Uuid::new_v4(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Send a user message into the default project.
    pub async fn send(&self, content: &str) -> DispatchOutcome {
        self.send_to(&self.project, content).await
    }

    /// Send a user message into a specific project.
    pub async fn send_to(&self, project: &Uuid, content: &str) -> DispatchOutcome {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.engram
            .handle_message(
                project,
                "chat-1",
                &format!("m-{n}"),
                "user",
                content,
                Utc::now(),
                n as i64,
            )
            .await
            .expect("handle_message")
    }

    /// Current values of a ranked list, in rank order.
    pub async fn list_values(&self, list_key: &str) -> Vec<String> {
        self.list_values_in(&self.project, list_key).await
    }

    pub async fn list_values_in(&self, project: &Uuid, list_key: &str) -> Vec<String> {
        let store = self.engram.fact_store(project).await.expect("store");
        store
            .get_ranked_list(list_key)
            .await
            .expect("list")
            .into_iter()
            .map(|(_, value, ..)| value)
            .collect()
    }

    /// Assert contiguity and normalized-value uniqueness for a list.
    pub async fn assert_list_invariants(&self, list_key: &str) {
        let store = self.engram.fact_store(&self.project).await.expect("store");
        let list = store.get_ranked_list(list_key).await.expect("list");
        let ranks: Vec<u32> = list.iter().map(|(rank, ..)| *rank).collect();
        let expected: Vec<u32> = (1..=list.len() as u32).collect();
        assert_eq!(ranks, expected, "ranks not contiguous for {list_key}");

        let mut normalized: Vec<String> = list
            .iter()
            .map(|(_, value, ..)| value.trim().to_lowercase())
            .collect();
        normalized.sort();
        let before = normalized.len();
        normalized.dedup();
        assert_eq!(before, normalized.len(), "duplicate values in {list_key}");
    }
}

/// Unwrap a facts-write reply.
pub fn expect_write(outcome: &DispatchOutcome) -> &ApplyResult {
    match &outcome.reply {
        PlaneReply::FactsWrite(result) => result,
        other => panic!("expected facts write reply, got {other:?}"),
    }
}

/// Unwrap a facts-read reply.
pub fn expect_read(outcome: &DispatchOutcome) -> &FactsReadReply {
    match &outcome.reply {
        PlaneReply::FactsRead(reply) => reply,
        other => panic!("expected facts read reply, got {other:?}"),
    }
}
