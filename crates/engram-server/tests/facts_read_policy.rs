// tests/facts_read_policy.rs
// Deterministic read guarantees: ordinal bounds, empty-valid answers,
// "last favorite" resolution, and the no-generative-fallback property.

mod common;

use std::sync::Arc;

use common::{expect_read, ForbiddenModel, TestHarness};
use engram_types::{ContentPlane, OrdinalSource, RouteSource};

const LIST_KEY: &str = "user.favorites.vacation_destination";

#[tokio::test]
async fn test_out_of_range_read_is_deterministic() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h.send("What is my fifth favorite vacation destination?").await;
    let read = expect_read(&outcome);
    assert_eq!(read.fast_path, "facts_retrieval");
    assert!(read.out_of_range);
    assert!(!read.facts_empty_valid);
    assert_eq!(read.answer.max_available_rank, Some(3));
    assert_eq!(read.answer.rank_result_found, Some(false));
    assert_eq!(read.answer.ordinal_parse_source, OrdinalSource::Router);
}

#[tokio::test]
async fn test_empty_list_read_is_empty_valid() {
    let h = TestHarness::new().await;

    let outcome = h.send("What is my second favorite vacation destination?").await;
    let read = expect_read(&outcome);
    assert!(read.facts_empty_valid);
    assert!(!read.out_of_range);
    assert_eq!(read.answer.count, 0);
    assert_eq!(read.answer.max_available_rank, None);
}

#[tokio::test]
async fn test_last_favorite_resolves_to_max_rank() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h.send("What is my last favorite vacation destination?").await;
    let read = expect_read(&outcome);
    assert_eq!(read.resolved_rank, Some(3));
    assert_eq!(read.answer.count, 1);
    assert_eq!(read.answer.facts[0].value_text, "New Zealand");
    assert!(!read.facts_empty_valid);
}

#[tokio::test]
async fn test_last_favorite_on_empty_list() {
    let h = TestHarness::new().await;

    let outcome = h.send("What is my last favorite breakfast food?").await;
    assert_eq!(outcome.plan.content_plane, ContentPlane::Facts);
    let read = expect_read(&outcome);
    assert!(read.facts_empty_valid);
    assert!(!read.out_of_range);
    assert_eq!(read.answer.count, 0);
}

#[tokio::test]
async fn test_full_list_read() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h.send("List my favorite vacation destinations").await;
    let read = expect_read(&outcome);
    assert_eq!(read.answer.count, 3);
    assert!(!read.answer.rank_applied);
    assert_eq!(read.answer.canonical_keys, vec![LIST_KEY.to_string()]);
}

#[tokio::test]
async fn test_deterministic_reads_never_touch_models() {
    // Router and planner are wired to panic if invoked; every message in
    // this flow must resolve through the deterministic override.
    let engram = engram::Engram::builder(engram::config::ServiceConfig::default())
        .in_memory()
        .router_model(Arc::new(ForbiddenModel("router")))
        .planner_model(Arc::new(ForbiddenModel("planner")))
        .teacher_model(Arc::new(common::SingularizingTeacher))
        .embedder(Arc::new(engram::embeddings::EmbeddingClient::deterministic(64)))
        .build()
        .await
        .expect("build");
    let h = TestHarness::wrap(engram);

    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;
    let outcome = h.send("What is my ninth favorite vacation destination?").await;
    assert_eq!(outcome.plan.source, RouteSource::Override);
    let read = expect_read(&outcome);
    assert!(read.out_of_range);
    assert_eq!(read.answer.max_available_rank, Some(3));

    let outcome = h.send("What is my last favorite vacation destination?").await;
    let read = expect_read(&outcome);
    assert_eq!(read.answer.facts[0].value_text, "New Zealand");
}

#[tokio::test]
async fn test_rank_directive_obedience() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    // "#2" must land at rank 2, never rank 1
    h.send("My #2 favorite vacation destination is Iceland.").await;
    let values = h.list_values(LIST_KEY).await;
    assert_eq!(values[0], "Japan");
    assert_eq!(values[1], "Iceland");

    let outcome = h.send("What is my second favorite vacation destination?").await;
    assert_eq!(expect_read(&outcome).answer.facts[0].value_text, "Iceland");
}
