// tests/ranked_list_consistency.rs
// Invariant checks under concurrent writers and mixed operation sequences.

mod common;

use std::sync::Arc;

use common::TestHarness;
use engram::db::pool::{DatabasePool, DbKind};
use engram::facts::apply_facts_ops;
use engram::facts::store::FactStore;
use engram_types::{FactsOp, FactsOpsResponse};

const PROJECT: &str = "22222222-2222-2222-2222-222222222222";
const LIST_KEY: &str = "user.favorites.album";

#[tokio::test]
async fn test_concurrent_appends_keep_ranks_contiguous() {
    let pool = Arc::new(
        DatabasePool::open_in_memory(DbKind::Project)
            .await
            .expect("open pool"),
    );

    // Ten writers race to append distinct values; the immediate-lock
    // transaction serializes the read-max/insert sequence.
    let mut handles = Vec::new();
    for i in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let ops = FactsOpsResponse::from_ops(vec![FactsOp::ranked_append(
                LIST_KEY,
                format!("Album {i}"),
            )]);
            apply_facts_ops(&pool, PROJECT, &format!("msg-{i}"), &ops, None).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("apply");
    }

    let store = FactStore::new(pool, PROJECT);
    let list = store.get_ranked_list(LIST_KEY).await.expect("list");
    assert_eq!(list.len(), 10);
    let ranks: Vec<u32> = list.iter().map(|(rank, ..)| *rank).collect();
    assert_eq!(ranks, (1..=10).collect::<Vec<u32>>());

    let mut values: Vec<String> = list.into_iter().map(|(_, value, ..)| value).collect();
    values.sort();
    values.dedup();
    assert_eq!(values.len(), 10, "every append must land exactly once");
}

#[tokio::test]
async fn test_fact_currency_under_supersession() {
    let pool = Arc::new(
        DatabasePool::open_in_memory(DbKind::Project)
            .await
            .expect("open pool"),
    );
    let store = FactStore::new(pool.clone(), PROJECT);

    for value in ["first", "second", "third"] {
        store
            .store_fact("user.editor", value, 1.0, "msg-x")
            .await
            .expect("store");
    }

    // At most one current row per (project, fact_key)
    let max_current: i64 = pool
        .interact(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(current_count), 0) FROM ( \
                     SELECT COUNT(*) AS current_count FROM project_facts \
                     WHERE is_current = 1 GROUP BY project_id, fact_key)",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
        .await
        .expect("query");
    assert_eq!(max_current, 1);

    // Supersession chain is preserved
    let fact = store
        .get_current_fact("user.editor")
        .await
        .expect("get")
        .expect("some");
    assert_eq!(fact.value_text, "third");
    assert!(fact.supersedes_fact_id.is_some());

    let total: i64 = pool
        .interact(|conn| {
            conn.query_row("SELECT COUNT(*) FROM project_facts", [], |row| row.get(0))
                .map_err(Into::into)
        })
        .await
        .expect("count");
    assert_eq!(total, 3, "superseded rows are never physically removed");
}

#[tokio::test]
async fn test_repeated_duplicate_appends_never_grow_list() {
    let h = TestHarness::new().await;
    h.send("My favorite candy is Reese's").await;
    for _ in 0..3 {
        h.send("My favorite candy is Reese's").await;
    }
    assert_eq!(
        h.list_values("user.favorites.candy").await,
        vec!["Reese's"]
    );
    h.assert_list_invariants("user.favorites.candy").await;
}

#[tokio::test]
async fn test_mixed_mutation_sequence_holds_invariants() {
    let h = TestHarness::new().await;
    h.send("My favorite albums are Kind of Blue, In Rainbows, and Blackstar")
        .await;
    h.send("My #1 favorite album is Blackstar").await;
    h.assert_list_invariants("user.favorites.album").await;

    h.send("My favorite albums are Aja and Low").await;
    h.assert_list_invariants("user.favorites.album").await;

    h.send("My #3 favorite album is Low").await;
    h.assert_list_invariants("user.favorites.album").await;

    let values = h.list_values("user.favorites.album").await;
    assert_eq!(values.len(), 5);
    assert_eq!(values[0], "Blackstar");
    assert_eq!(values[2], "Low");
}
