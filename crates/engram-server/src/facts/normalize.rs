// crates/engram-server/src/facts/normalize.rs
// Deterministic fact key/value normalizers
//
// These are total functions (never fail) that sanitize and canonicalize
// fact keys and values. They return sanitized output even for invalid
// input, with an optional warning for the caller to surface.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub const MAX_FACT_KEY_LENGTH: usize = 200;
/// Length clamp for ranked list values
pub const MAX_FACT_VALUE_LENGTH: usize = 256;
/// Length clamp for other facts
pub const MAX_GENERIC_VALUE_LENGTH: usize = 1000;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));
static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r" +").expect("static regex"));
static NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));
static TRAILING_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.,!?;:]+$").expect("static regex"));
static KEY_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_.]*$").expect("static regex"));
static LIST_KEY_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^user\.favorites\.([^.]+)$").expect("static regex"));

/// Normalize a fact key to canonical form.
///
/// Trims and collapses whitespace, strips control characters, auto-prefixes
/// bare keys with `user.`, and clamps to [`MAX_FACT_KEY_LENGTH`].
pub fn normalize_fact_key(key: &str) -> (String, Option<String>) {
    if key.trim().is_empty() {
        return ("user.unknown".to_string(), Some("Empty fact key provided".to_string()));
    }

    let mut normalized = WHITESPACE_RUN
        .replace_all(key.trim(), " ")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();

    if !normalized.starts_with("user.") && !normalized.starts_with("system.") {
        normalized = format!("user.{normalized}");
        tracing::debug!("Auto-prefixed fact key with 'user.': {}", normalized);
    }

    let original_length = normalized.chars().count();
    if original_length > MAX_FACT_KEY_LENGTH {
        normalized = normalized.chars().take(MAX_FACT_KEY_LENGTH).collect();
        let warning = format!(
            "Fact key truncated from {original_length} to {MAX_FACT_KEY_LENGTH} chars"
        );
        tracing::warn!("{}: {}", warning, normalized);
        return (normalized, Some(warning));
    }

    if !KEY_FORMAT.is_match(&normalized) {
        let warning = format!("Fact key contains unusual characters: {normalized}");
        tracing::warn!("{}", warning);
        return (normalized, Some(warning));
    }

    (normalized, None)
}

/// Normalize a fact value.
///
/// Trims, collapses space runs and newline runs, strips control characters
/// (keeping newlines and tabs), and clamps to the ranked or generic length
/// limit.
pub fn normalize_fact_value(value: &str, is_ranked_list: bool) -> (String, Option<String>) {
    if value.trim().is_empty() {
        return (String::new(), Some("Empty fact value provided".to_string()));
    }

    let mut normalized = value.trim().to_string();
    normalized = SPACE_RUN.replace_all(&normalized, " ").into_owned();
    normalized = NEWLINE_RUN.replace_all(&normalized, "\n\n").into_owned();
    normalized = normalized
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let max_length = if is_ranked_list {
        MAX_FACT_VALUE_LENGTH
    } else {
        MAX_GENERIC_VALUE_LENGTH
    };
    let original_length = normalized.chars().count();
    if original_length > max_length {
        normalized = normalized.chars().take(max_length).collect();
        let warning =
            format!("Fact value truncated from {original_length} to {max_length} chars");
        tracing::warn!("{}", warning);
        return (normalized, Some(warning));
    }

    (normalized, None)
}

/// Canonical normalizer for ranked-list items: the single source of truth
/// for equality on ranked items. Applied for comparison only; the stored
/// value keeps its original casing.
///
/// Steps, in order: Unicode NFKC, smart-quote mapping, trim + collapse
/// internal whitespace, strip trailing `.,!?;:`, lowercase.
pub fn normalize_rank_item(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }

    let nfkc: String = s.nfkc().collect();

    let quoted: String = nfkc
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            other => other,
        })
        .collect();

    let collapsed = WHITESPACE_RUN.replace_all(quoted.trim(), " ");
    let stripped = TRAILING_PUNCT.replace(&collapsed, "");
    stripped.to_lowercase()
}

/// Tokenize a normalized string into a set of words, dropping stop-word
/// length tokens (1-2 chars).
pub fn tokenize_normalized(s: &str) -> BTreeSet<String> {
    s.split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_string())
        .collect()
}

/// Slug form of a canonical topic, safe for use inside fact keys
/// (lowercase, `[a-z0-9_]`).
pub fn topic_slug(topic: &str) -> String {
    let lowered = topic.trim().to_lowercase();
    let slug: String = WHITESPACE_RUN
        .replace_all(&lowered, "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Canonical list key for a topic: `user.favorites.<topic>`.
pub fn canonical_list_key(topic: &str) -> String {
    format!("user.favorites.{}", topic_slug(topic))
}

/// Canonical rank key for a topic and rank: `user.favorites.<topic>.<rank>`.
pub fn canonical_rank_key(topic: &str, rank: u32) -> String {
    format!("{}.{}", canonical_list_key(topic), rank)
}

/// Extract the topic from a canonical list key
/// (`user.favorites.crypto` → `crypto`).
pub fn extract_topic_from_list_key(list_key: &str) -> Option<String> {
    LIST_KEY_FORMAT
        .captures(list_key)
        .map(|c| c[1].to_string())
}

/// Extract the rank suffix from a rank key
/// (`user.favorites.crypto.2` → 2).
pub fn rank_from_fact_key(fact_key: &str) -> Option<u32> {
    fact_key.rsplit_once('.').and_then(|(_, suffix)| suffix.parse().ok())
}
