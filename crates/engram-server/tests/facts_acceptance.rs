// tests/facts_acceptance.rs
// End-to-end acceptance flows for the facts planes: seeding, bulk appends
// with duplicates, explicit-rank mutations, alias moves, and the
// deterministic read guarantees.

mod common;

use common::{expect_read, expect_write, TestHarness};
use engram_types::{MutationAction, RankSource, RouteSource};

const LIST_KEY: &str = "user.favorites.vacation_destination";

#[tokio::test]
async fn test_seed_bulk_write_and_ordinal_read() {
    let h = TestHarness::new().await;

    let outcome = h
        .send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;
    assert_eq!(outcome.plan.source, RouteSource::Override);
    let write = expect_write(&outcome);
    assert_eq!(write.store_count, 3);
    assert!(write.is_clean());
    assert!(write
        .rank_assignment_source
        .values()
        .all(|s| *s == RankSource::AtomicAppend));

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "New Zealand"]
    );
    h.assert_list_invariants(LIST_KEY).await;

    let outcome = h.send("What is my second favorite vacation destination?").await;
    let read = expect_read(&outcome);
    assert_eq!(read.fast_path, "facts_retrieval");
    assert_eq!(read.answer.count, 1);
    assert_eq!(read.answer.facts[0].value_text, "Italy");
    assert_eq!(read.answer.rank_result_found, Some(true));
    assert!(!read.facts_empty_valid);
    assert!(!read.out_of_range);
}

#[tokio::test]
async fn test_bulk_append_with_duplicates() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h
        .send("My favorite vacation destinations are Spain, Greece and Thailand.")
        .await;
    let write = expect_write(&outcome);
    assert_eq!(write.store_count, 3);
    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "New Zealand", "Spain", "Greece", "Thailand"]
    );

    let outcome = h
        .send("My favorite vacation destinations are Portugal, Greece, and Japan.")
        .await;
    let write = expect_write(&outcome);
    assert_eq!(write.store_count, 1);
    assert_eq!(write.stored_fact_keys, vec![format!("{LIST_KEY}.7")]);

    let greece = write.duplicate_blocked.get("greece").expect("greece blocked");
    assert_eq!(greece.existing_rank, 5);
    let japan = write.duplicate_blocked.get("japan").expect("japan blocked");
    assert_eq!(japan.existing_rank, 1);

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "New Zealand", "Spain", "Greece", "Thailand", "Portugal"]
    );
    h.assert_list_invariants(LIST_KEY).await;
}

#[tokio::test]
async fn test_move_directive() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;
    h.send("My favorite vacation destinations are Spain, Greece and Thailand.")
        .await;
    h.send("My favorite vacation destinations are Portugal, Greece, and Japan.")
        .await;

    let outcome = h.send("My #2 favorite vacation destination is Thailand.").await;
    assert_eq!(outcome.plan.source, RouteSource::Override);
    let write = expect_write(&outcome);
    let mutation = write
        .rank_mutations
        .get(&format!("{LIST_KEY}.2"))
        .expect("mutation recorded");
    assert_eq!(mutation.action, MutationAction::Move);
    assert_eq!(mutation.old_rank, Some(6));
    assert_eq!(mutation.new_rank, 2);
    assert_eq!(
        write.rank_assignment_source.get(&format!("{LIST_KEY}.2")),
        Some(&RankSource::Explicit)
    );

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Thailand", "Italy", "New Zealand", "Spain", "Greece", "Portugal"]
    );
    h.assert_list_invariants(LIST_KEY).await;
}

#[tokio::test]
async fn test_insert_directive() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, New Zealand, Spain and Greece.")
        .await;

    let outcome = h.send("My #3 favorite vacation destination is Iceland.").await;
    let write = expect_write(&outcome);
    let mutation = write
        .rank_mutations
        .get(&format!("{LIST_KEY}.3"))
        .expect("mutation recorded");
    assert_eq!(mutation.action, MutationAction::Insert);

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "Iceland", "New Zealand", "Spain", "Greece"]
    );
    h.assert_list_invariants(LIST_KEY).await;
}

#[tokio::test]
async fn test_rank_beyond_length_appends() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h.send("My #99 favorite vacation destination is Morocco.").await;
    let write = expect_write(&outcome);
    let mutation = write
        .rank_mutations
        .get(&format!("{LIST_KEY}.4"))
        .expect("mutation recorded");
    assert_eq!(mutation.action, MutationAction::Append);
    assert_eq!(mutation.new_rank, 4);

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "New Zealand", "Morocco"]
    );
    h.assert_list_invariants(LIST_KEY).await;
}

#[tokio::test]
async fn test_noop_directive() {
    let h = TestHarness::new().await;
    h.send("My favorite vacation destinations are Japan, Italy, and New Zealand.")
        .await;

    let outcome = h.send("My #2 favorite vacation destination is Italy.").await;
    let write = expect_write(&outcome);
    let mutation = write
        .rank_mutations
        .get(&format!("{LIST_KEY}.2"))
        .expect("mutation recorded");
    assert_eq!(mutation.action, MutationAction::Noop);
    assert_eq!((write.store_count, write.update_count), (0, 0));

    assert_eq!(
        h.list_values(LIST_KEY).await,
        vec!["Japan", "Italy", "New Zealand"]
    );
}

#[tokio::test]
async fn test_alias_move_preserves_canonical_title() {
    let h = TestHarness::new().await;
    h.send(
        "My favorite sci-fi movies are Dune, Alien, Blade Runner, Arrival, \
         Interstellar, Primer, Sunshine and Star Wars: Rogue One",
    )
    .await;

    let list_key = "user.favorites.scifi_movie";
    assert_eq!(h.list_values(list_key).await.len(), 8);

    let outcome = h.send("My #2 favorite sci-fi movie is rogue one.").await;
    let write = expect_write(&outcome);
    let mutation = write
        .rank_mutations
        .get(&format!("{list_key}.2"))
        .expect("mutation recorded");
    assert_eq!(mutation.action, MutationAction::Move);
    assert_eq!(mutation.old_rank, Some(8));

    let values = h.list_values(list_key).await;
    assert_eq!(values.len(), 8);
    assert_eq!(values[1], "Star Wars: Rogue One");
    assert_eq!(values.iter().filter(|v| v.contains("Rogue One")).count(), 1);
    h.assert_list_invariants(list_key).await;
}

#[tokio::test]
async fn test_cross_project_isolation() {
    let h = TestHarness::new().await;
    let project_a = h.project;
    let project_b = uuid::Uuid::new_v4();

    h.send_to(&project_a, "My favorite candy is Reese's").await;
    h.send_to(&project_b, "My favorite candy is Snickers").await;

    assert_eq!(
        h.list_values_in(&project_a, "user.favorites.candy").await,
        vec!["Reese's"]
    );
    assert_eq!(
        h.list_values_in(&project_b, "user.favorites.candy").await,
        vec!["Snickers"]
    );
}

#[tokio::test]
async fn test_message_uuid_cited_by_facts() {
    let h = TestHarness::new().await;
    let outcome = h.send("My favorite candy is Reese's").await;
    assert!(!outcome.message_uuid.is_empty());

    let store = h.engram.fact_store(&h.project).await.expect("store");
    let list = store
        .get_ranked_list("user.favorites.candy")
        .await
        .expect("list");
    assert_eq!(list.len(), 1);
    assert_eq!(
        list[0].3.as_deref(),
        Some(outcome.message_uuid.as_str()),
        "fact must cite the originating message"
    );
}
