// crates/engram-server/src/facts/ranked.rs
// Ranked-list engine: alias resolution, MOVE/INSERT/NO-OP/APPEND, invariants

use anyhow::Result;
use chrono::Utc;
use engram_types::MutationAction;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::normalize::{normalize_rank_item, rank_from_fact_key, tokenize_normalized};

/// Minimum fuzzy-match score for alias target resolution.
pub const ALIAS_MATCH_THRESHOLD: f64 = 0.85;

/// One current item of a ranked list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub fact_key: String,
    pub rank: u32,
    pub value_text: String,
}

/// Outcome of one explicit-rank mutation.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub action: MutationAction,
    pub old_rank: Option<u32>,
    pub new_rank: u32,
    /// (old_rank, new_rank, value) for every item that was shifted.
    pub shifted_items: Vec<(u32, u32, String)>,
}

/// Rank key under a list key: `<list_key>.<rank>`.
pub fn rank_key(list_key: &str, rank: u32) -> String {
    format!("{list_key}.{rank}")
}

/// Load the current ranked list for a list key, sorted by rank.
///
/// Must be called within an active transaction when used for mutation.
pub fn get_ranked_list_items(
    conn: &Connection,
    project_uuid: &str,
    list_key: &str,
) -> Result<Vec<RankedItem>> {
    let mut stmt = conn.prepare(
        "SELECT fact_key, value_text FROM project_facts \
         WHERE project_id = ?1 AND fact_key LIKE ?2 AND is_current = 1 \
         ORDER BY fact_key",
    )?;
    let rows = stmt.query_map(params![project_uuid, format!("{list_key}.%")], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (fact_key, value_text) = row?;
        if let Some(rank) = rank_from_fact_key(&fact_key) {
            items.push(RankedItem {
                fact_key,
                rank,
                value_text,
            });
        }
    }
    items.sort_by_key(|item| item.rank);
    Ok(items)
}

/// Maximum rank currently present for a list key (0 when the list is empty).
///
/// Must be called within an active immediate transaction so the
/// read-max-then-insert sequence is serialized against other writers.
pub fn get_max_rank(conn: &Connection, project_uuid: &str, list_key: &str) -> Result<u32> {
    let items = get_ranked_list_items(conn, project_uuid, list_key)?;
    Ok(items.iter().map(|i| i.rank).max().unwrap_or(0))
}

/// Check whether a value already exists in a ranked list (exact normalized
/// match only) and return its rank.
pub fn check_value_exists(
    conn: &Connection,
    project_uuid: &str,
    list_key: &str,
    value: &str,
) -> Result<Option<u32>> {
    let normalized_input = normalize_rank_item(value);
    let items = get_ranked_list_items(conn, project_uuid, list_key)?;
    for item in items {
        let normalized_existing = normalize_rank_item(&item.value_text);
        if !normalized_existing.is_empty() && normalized_existing == normalized_input {
            return Ok(Some(item.rank));
        }
    }
    Ok(None)
}

/// Resolve a new value to an existing ranked item using exact or
/// fuzzy/alias matching.
///
/// This lets partial values ("rogue one") match full canonical items
/// ("Star Wars: Rogue One"). Exact normalized match wins; otherwise the
/// new value's tokens must all appear in the candidate (subset score 1.0)
/// or the subset score must reach [`ALIAS_MATCH_THRESHOLD`], with Jaccard
/// similarity as tie-break.
pub fn resolve_ranked_item_target<'a>(
    new_value: &str,
    existing_items: &'a [RankedItem],
) -> Option<&'a RankedItem> {
    if existing_items.is_empty() {
        return None;
    }

    let normalized_new = normalize_rank_item(new_value);
    let tokens_new = tokenize_normalized(&normalized_new);
    if tokens_new.is_empty() {
        return None;
    }

    // Exact normalized match first
    for item in existing_items {
        if normalize_rank_item(&item.value_text) == normalized_new {
            tracing::debug!(
                "Exact match: '{}' -> '{}' (rank {})",
                new_value,
                item.value_text,
                item.rank
            );
            return Some(item);
        }
    }

    let mut best_match: Option<&RankedItem> = None;
    let mut best_score = 0.0f64;

    for item in existing_items {
        let normalized_existing = normalize_rank_item(&item.value_text);
        let tokens_existing = tokenize_normalized(&normalized_existing);
        if tokens_existing.is_empty() {
            continue;
        }

        let intersection = tokens_new.intersection(&tokens_existing).count() as f64;
        let subset_score = intersection / tokens_new.len() as f64;
        let union = tokens_new.union(&tokens_existing).count() as f64;
        let jaccard = if union > 0.0 { intersection / union } else { 0.0 };

        let score = if (subset_score - 1.0).abs() < f64::EPSILON {
            // Every token of the new value appears in the candidate
            1.0 + jaccard
        } else if subset_score >= ALIAS_MATCH_THRESHOLD {
            subset_score + jaccard * 0.1
        } else {
            continue;
        };

        if score > best_score {
            best_score = score;
            best_match = Some(item);
        }
    }

    if let Some(matched) = best_match {
        tracing::info!(
            "Alias/fuzzy match: '{}' -> '{}' (rank {}, score={:.3})",
            new_value,
            matched.value_text,
            matched.rank,
            best_score
        );
    }
    best_match
}

/// Insert a new current fact row and return its fact_id.
pub fn insert_fact_row(
    conn: &Connection,
    project_uuid: &str,
    fact_key: &str,
    value_text: &str,
    confidence: f64,
    source_message_uuid: &str,
    supersedes_fact_id: Option<&str>,
) -> Result<String> {
    let fact_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO project_facts \
         (fact_id, project_id, fact_key, value_text, value_type, confidence, \
          source_message_uuid, created_at, effective_at, supersedes_fact_id, is_current) \
         VALUES (?1, ?2, ?3, ?4, 'string', ?5, ?6, ?7, ?7, ?8, 1)",
        params![
            fact_id,
            project_uuid,
            fact_key,
            value_text,
            confidence,
            source_message_uuid,
            now,
            supersedes_fact_id
        ],
    )?;
    Ok(fact_id)
}

/// Mark every current row with this fact_key as superseded.
pub fn mark_not_current(conn: &Connection, project_uuid: &str, fact_key: &str) -> Result<usize> {
    let count = conn.execute(
        "UPDATE project_facts SET is_current = 0 \
         WHERE project_id = ?1 AND fact_key = ?2 AND is_current = 1",
        params![project_uuid, fact_key],
    )?;
    Ok(count)
}

/// Apply a ranked mutation: MOVE, INSERT, NO-OP, or APPEND.
///
/// Must run inside an active immediate transaction. `value` is the raw
/// user value (used for matching); `normalized_value` is the sanitized
/// form for storage. When a fuzzy match is found, the stored value is the
/// existing canonical form and the list is mutated, not duplicated.
pub fn apply_ranked_mutation(
    conn: &Connection,
    project_uuid: &str,
    list_key: &str,
    desired_rank: u32,
    value: &str,
    message_uuid: &str,
    normalized_value: &str,
) -> Result<MutationOutcome> {
    let items = get_ranked_list_items(conn, project_uuid, list_key)?;
    let current_max_rank = items.len() as u32;

    // Resolve the new value against the existing list (exact, then fuzzy)
    let matched_item = resolve_ranked_item_target(value, &items).cloned();

    // Collect every occurrence of the target's normalized form so the
    // mutation cannot leave duplicates behind.
    let normalized_input = normalize_rank_item(value);
    let target_normalized = matched_item
        .as_ref()
        .map(|m| normalize_rank_item(&m.value_text))
        .unwrap_or_else(|| normalized_input.clone());
    let mut existing_items: Vec<RankedItem> = items
        .iter()
        .filter(|item| normalize_rank_item(&item.value_text) == target_normalized)
        .cloned()
        .collect();

    // When a fuzzy match was found, store the canonical value from the list
    let mut stored_value = normalized_value.to_string();
    if let Some(matched) = &matched_item {
        if normalize_rank_item(matched.value_text.as_str()) != normalized_input {
            tracing::info!(
                "Using canonical value from fuzzy match: '{}' -> '{}'",
                value,
                matched.value_text
            );
        }
        stored_value = super::normalize::normalize_fact_value(&matched.value_text, true).0;
        if existing_items.is_empty() {
            existing_items.push(matched.clone());
        }
    }

    let existing_rank = existing_items.first().map(|item| item.rank);

    // Rank beyond length: clamp. A MOVE keeps the list the same length,
    // so its last valid position is N; an INSERT grows it, so N+1.
    let mut clamped = false;
    let mut desired_rank = desired_rank;
    let last_position = if existing_rank.is_some() {
        current_max_rank.max(1)
    } else {
        current_max_rank + 1
    };
    if desired_rank > last_position {
        tracing::info!(
            "Rank {} beyond list length ({}), clamping to {}",
            desired_rank,
            current_max_rank,
            last_position
        );
        desired_rank = last_position;
        clamped = true;
    }

    let existing_ranks: std::collections::BTreeSet<u32> =
        existing_items.iter().map(|item| item.rank).collect();
    let mut outcome = MutationOutcome {
        action: MutationAction::Insert,
        old_rank: None,
        new_rank: desired_rank,
        shifted_items: Vec::new(),
    };

    if let Some(existing_rank) = existing_rank {
        if existing_rank == desired_rank {
            // Already at the desired rank: NO-OP. Sweep only stray
            // duplicates at other ranks (there are none under invariants).
            for dup in existing_items.iter().filter(|d| d.rank != desired_rank) {
                mark_not_current(conn, project_uuid, &dup.fact_key)?;
            }
            outcome.action = MutationAction::Noop;
            outcome.old_rank = Some(desired_rank);
            tracing::info!(
                "Rank mutation NO-OP: '{}' already at rank {} ({})",
                value,
                desired_rank,
                list_key
            );
            return Ok(outcome);
        }

        // Remove every occurrence of the target before re-inserting it
        tracing::info!(
            "Found {} occurrence(s) of '{}' at ranks {:?}; removing before mutation",
            existing_items.len(),
            value,
            existing_items.iter().map(|i| i.rank).collect::<Vec<_>>()
        );
        for dup in &existing_items {
            mark_not_current(conn, project_uuid, &dup.fact_key)?;
        }

        // MOVE: the value exists at a different rank
        outcome.action = MutationAction::Move;
        outcome.old_rank = Some(existing_rank);

        let (shift_start, shift_end, shift_delta): (u32, u32, i64) = if existing_rank > desired_rank
        {
            // Moving earlier: items at [desired..existing-1] shift down by +1
            (desired_rank, existing_rank - 1, 1)
        } else {
            // Moving later: items at [existing+1..desired] shift up by -1
            (existing_rank + 1, desired_rank, -1)
        };

        let mut items_to_shift: Vec<&RankedItem> = items
            .iter()
            .filter(|item| {
                !existing_ranks.contains(&item.rank)
                    && item.rank >= shift_start
                    && item.rank <= shift_end
            })
            .collect();
        // Shift order matters: never overwrite a rank that has not moved yet
        if existing_rank > desired_rank {
            items_to_shift.sort_by(|a, b| b.rank.cmp(&a.rank));
        } else {
            items_to_shift.sort_by(|a, b| a.rank.cmp(&b.rank));
        }

        for item in items_to_shift {
            let new_rank = (item.rank as i64 + shift_delta) as u32;
            mark_not_current(conn, project_uuid, &item.fact_key)?;
            insert_fact_row(
                conn,
                project_uuid,
                &rank_key(list_key, new_rank),
                &item.value_text,
                1.0,
                message_uuid,
                None,
            )?;
            outcome.shifted_items.push((item.rank, new_rank, item.value_text.clone()));
            tracing::debug!(
                "Shifted item: rank {} -> {} value='{}'",
                item.rank,
                new_rank,
                item.value_text
            );
        }

        // Safety net: clear anything still current at the target rank
        mark_not_current(conn, project_uuid, &rank_key(list_key, desired_rank))?;
        insert_fact_row(
            conn,
            project_uuid,
            &rank_key(list_key, desired_rank),
            &stored_value,
            1.0,
            message_uuid,
            None,
        )?;

        tracing::info!(
            "Rank mutation MOVE: '{}' from rank {} to {} ({}), shifted {} items",
            value,
            existing_rank,
            desired_rank,
            list_key,
            outcome.shifted_items.len()
        );
    } else {
        // INSERT (or APPEND when the rank was clamped past the end)
        outcome.action = if clamped {
            MutationAction::Append
        } else {
            MutationAction::Insert
        };

        let mut items_to_shift: Vec<&RankedItem> = items
            .iter()
            .filter(|item| item.rank >= desired_rank && !existing_ranks.contains(&item.rank))
            .collect();
        items_to_shift.sort_by(|a, b| b.rank.cmp(&a.rank));

        for item in items_to_shift {
            let new_rank = item.rank + 1;
            mark_not_current(conn, project_uuid, &item.fact_key)?;
            insert_fact_row(
                conn,
                project_uuid,
                &rank_key(list_key, new_rank),
                &item.value_text,
                1.0,
                message_uuid,
                None,
            )?;
            outcome.shifted_items.push((item.rank, new_rank, item.value_text.clone()));
        }

        insert_fact_row(
            conn,
            project_uuid,
            &rank_key(list_key, desired_rank),
            &stored_value,
            1.0,
            message_uuid,
            None,
        )?;

        tracing::info!(
            "Rank mutation {:?}: '{}' at rank {} ({}), shifted {} items",
            outcome.action,
            value,
            desired_rank,
            list_key,
            outcome.shifted_items.len()
        );
    }

    Ok(outcome)
}

/// Validate ranked-list invariants: contiguous ranks 1..N, no duplicate
/// normalized values, no duplicate ranks.
pub fn validate_ranked_list_invariants(
    items: &[RankedItem],
    list_key: &str,
) -> std::result::Result<(), String> {
    if items.is_empty() {
        return Ok(());
    }

    let ranks: Vec<u32> = items.iter().map(|i| i.rank).collect();
    let expected: std::collections::BTreeSet<u32> = (1..=items.len() as u32).collect();
    let actual: std::collections::BTreeSet<u32> = ranks.iter().copied().collect();

    if expected != actual {
        let missing: Vec<u32> = expected.difference(&actual).copied().collect();
        let extra: Vec<u32> = actual.difference(&expected).copied().collect();
        return Err(format!(
            "Ranked list '{}' has non-contiguous ranks. Expected 1..{}, found {:?}. Missing: {:?}, Extra: {:?}",
            list_key,
            items.len(),
            ranks,
            missing,
            extra
        ));
    }

    let mut seen: std::collections::HashMap<String, &RankedItem> = std::collections::HashMap::new();
    for item in items {
        let normalized = normalize_rank_item(&item.value_text);
        if let Some(existing) = seen.get(normalized.as_str()) {
            return Err(format!(
                "Ranked list '{}' has duplicate values. Value '{}' at rank {} duplicates '{}' at rank {} (normalized: '{}')",
                list_key, item.value_text, item.rank, existing.value_text, existing.rank, normalized
            ));
        }
        seen.insert(normalized, item);
    }

    let mut rank_counts: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();
    for rank in &ranks {
        let count = rank_counts.entry(*rank).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Err(format!(
                "Ranked list '{list_key}' has duplicate rank {rank}. Each rank must appear exactly once."
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(rank: u32, value: &str) -> RankedItem {
        RankedItem {
            fact_key: format!("user.favorites.test.{rank}"),
            rank,
            value_text: value.to_string(),
        }
    }

    // ============================================================================
    // resolve_ranked_item_target tests
    // ============================================================================

    #[test]
    fn test_exact_match_beats_fuzzy() {
        let items = vec![item(1, "The Matrix"), item(2, "Matrix Revolutions")];
        let matched = resolve_ranked_item_target("the matrix", &items).unwrap();
        assert_eq!(matched.rank, 1);
    }

    #[test]
    fn test_alias_match_partial_title() {
        let items = vec![item(1, "Dune"), item(8, "Star Wars: Rogue One")];
        let matched = resolve_ranked_item_target("rogue one", &items).unwrap();
        assert_eq!(matched.rank, 8);
    }

    #[test]
    fn test_subset_match_long_title() {
        let items = vec![item(1, "The Legend of Zelda: Breath of the Wild")];
        let matched = resolve_ranked_item_target("breath of the wild", &items).unwrap();
        assert_eq!(matched.rank, 1);
    }

    #[test]
    fn test_no_match_below_threshold() {
        let items = vec![item(1, "Japan"), item(2, "Italy")];
        assert!(resolve_ranked_item_target("Morocco", &items).is_none());
    }

    #[test]
    fn test_stop_word_only_value_never_matches() {
        let items = vec![item(1, "It")];
        assert!(resolve_ranked_item_target("it", &items).is_none());
    }

    // ============================================================================
    // invariant validation tests
    // ============================================================================

    #[test]
    fn test_invariants_pass_contiguous() {
        let items = vec![item(1, "Japan"), item(2, "Italy"), item(3, "Spain")];
        assert!(validate_ranked_list_invariants(&items, "user.favorites.test").is_ok());
    }

    #[test]
    fn test_invariants_empty_list_ok() {
        assert!(validate_ranked_list_invariants(&[], "user.favorites.test").is_ok());
    }

    #[test]
    fn test_invariants_detect_gap() {
        let items = vec![item(1, "Japan"), item(3, "Italy")];
        let err = validate_ranked_list_invariants(&items, "user.favorites.test").unwrap_err();
        assert!(err.contains("non-contiguous"));
    }

    #[test]
    fn test_invariants_detect_duplicate_value() {
        let items = vec![item(1, "Japan"), item(2, "japan.")];
        let err = validate_ranked_list_invariants(&items, "user.favorites.test").unwrap_err();
        assert!(err.contains("duplicate values"));
    }

    // ============================================================================
    // mutation tests (in-memory database)
    // ============================================================================

    fn seeded_conn(values: &[&str]) -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        crate::db::schema::run_project_migrations(&conn).expect("migrate");
        for (i, value) in values.iter().enumerate() {
            insert_fact_row(
                &conn,
                "p1",
                &rank_key("user.favorites.test", i as u32 + 1),
                value,
                1.0,
                "seed-uuid",
                None,
            )
            .expect("seed");
        }
        conn
    }

    fn list_values(conn: &Connection) -> Vec<String> {
        get_ranked_list_items(conn, "p1", "user.favorites.test")
            .expect("list")
            .into_iter()
            .map(|i| i.value_text)
            .collect()
    }

    #[test]
    fn test_move_later_to_earlier() {
        let conn = seeded_conn(&[
            "Japan",
            "Italy",
            "New Zealand",
            "Spain",
            "Greece",
            "Thailand",
            "Portugal",
        ]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            2,
            "Thailand",
            "msg-uuid",
            "Thailand",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Move);
        assert_eq!(outcome.old_rank, Some(6));
        assert_eq!(outcome.new_rank, 2);
        assert_eq!(
            list_values(&conn),
            vec!["Japan", "Thailand", "Italy", "New Zealand", "Spain", "Greece", "Portugal"]
        );
        let items = get_ranked_list_items(&conn, "p1", "user.favorites.test").expect("items");
        validate_ranked_list_invariants(&items, "user.favorites.test").expect("invariants");
    }

    #[test]
    fn test_move_earlier_to_later() {
        let conn = seeded_conn(&["A one", "B two", "C three", "D four"]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            4,
            "A one",
            "msg-uuid",
            "A one",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Move);
        assert_eq!(list_values(&conn), vec!["B two", "C three", "D four", "A one"]);
    }

    #[test]
    fn test_insert_shifts_down() {
        let conn = seeded_conn(&["Japan", "Italy", "New Zealand", "Spain", "Greece"]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            3,
            "Iceland",
            "msg-uuid",
            "Iceland",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Insert);
        assert_eq!(
            list_values(&conn),
            vec!["Japan", "Italy", "Iceland", "New Zealand", "Spain", "Greece"]
        );
    }

    #[test]
    fn test_noop_when_already_at_rank() {
        let conn = seeded_conn(&["Japan", "Italy"]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            2,
            "italy",
            "msg-uuid",
            "italy",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Noop);
        assert_eq!(list_values(&conn), vec!["Japan", "Italy"]);
    }

    #[test]
    fn test_rank_beyond_length_appends() {
        let conn = seeded_conn(&["Japan", "Italy", "New Zealand"]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            99,
            "Morocco",
            "msg-uuid",
            "Morocco",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Append);
        assert_eq!(outcome.new_rank, 4);
        assert_eq!(
            list_values(&conn),
            vec!["Japan", "Italy", "New Zealand", "Morocco"]
        );
    }

    #[test]
    fn test_move_beyond_length_clamps_to_last_position() {
        let conn = seeded_conn(&["Japan", "Italy", "New Zealand"]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            99,
            "Japan",
            "msg-uuid",
            "Japan",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Move);
        assert_eq!(outcome.new_rank, 3);
        assert_eq!(list_values(&conn), vec!["Italy", "New Zealand", "Japan"]);
        let items = get_ranked_list_items(&conn, "p1", "user.favorites.test").expect("items");
        validate_ranked_list_invariants(&items, "user.favorites.test").expect("invariants");
    }

    #[test]
    fn test_alias_move_stores_canonical_value() {
        let conn = seeded_conn(&[
            "Dune", "Alien", "Blade Runner", "Arrival", "Interstellar", "Primer", "Sunshine",
            "Star Wars: Rogue One",
        ]);
        let outcome = apply_ranked_mutation(
            &conn,
            "p1",
            "user.favorites.test",
            2,
            "rogue one",
            "msg-uuid",
            "rogue one",
        )
        .expect("mutation");

        assert_eq!(outcome.action, MutationAction::Move);
        assert_eq!(outcome.old_rank, Some(8));
        let values = list_values(&conn);
        assert_eq!(values.len(), 8);
        assert_eq!(values[1], "Star Wars: Rogue One");
        assert_eq!(
            values.iter().filter(|v| v.contains("Rogue One")).count(),
            1
        );
        let items = get_ranked_list_items(&conn, "p1", "user.favorites.test").expect("items");
        validate_ranked_list_invariants(&items, "user.favorites.test").expect("invariants");
    }
}
