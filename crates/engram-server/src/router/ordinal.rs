// crates/engram-server/src/router/ordinal.rs
// Shared ordinal detection for the router and query planner

use once_cell::sync::Lazy;
use regex::Regex;

/// Ordinal words and numeric ordinals up to tenth, checked in rank order.
const ORDINAL_WORDS: [(&str, u32); 20] = [
    ("first", 1),
    ("1st", 1),
    ("second", 2),
    ("2nd", 2),
    ("third", 3),
    ("3rd", 3),
    ("fourth", 4),
    ("4th", 4),
    ("fifth", 5),
    ("5th", 5),
    ("sixth", 6),
    ("6th", 6),
    ("seventh", 7),
    ("7th", 7),
    ("eighth", 8),
    ("8th", 8),
    ("ninth", 9),
    ("9th", 9),
    ("tenth", 10),
    ("10th", 10),
];

static HASH_RANK: Lazy<Regex> = Lazy::new(|| Regex::new(r"#(\d+)").expect("static regex"));
static NUM_WITH_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:number\s+|#|rank\s+)(\d+)").expect("static regex"));
static ORDINAL_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(first|1st|second|2nd|third|3rd|fourth|4th|fifth|5th|sixth|6th|seventh|7th|eighth|8th|ninth|9th|tenth|10th)\b",
    )
    .expect("static regex")
});

/// Detect an ordinal rank request in a query.
///
/// Recognizes ordinal words (first..tenth), numeric ordinals (1st..10th),
/// hash notation (#N), and "number N" / "rank N". Returns the 1-based rank
/// when found and within [1, 10]. When several ordinal words appear, the
/// lowest rank wins.
pub fn detect_ordinal_rank(text: &str) -> Option<u32> {
    let text_lower = text.to_lowercase();

    let word_rank = ORDINAL_WORD
        .find_iter(&text_lower)
        .filter_map(|m| {
            ORDINAL_WORDS
                .iter()
                .find(|(word, _)| *word == m.as_str())
                .map(|(_, rank)| *rank)
        })
        .min();
    if let Some(rank) = word_rank {
        return Some(rank);
    }

    if let Some(caps) = HASH_RANK.captures(text) {
        if let Ok(rank) = caps[1].parse::<u32>() {
            if (1..=10).contains(&rank) {
                return Some(rank);
            }
        }
    }

    if let Some(caps) = NUM_WITH_CONTEXT.captures(&text_lower) {
        if let Ok(rank) = caps[1].parse::<u32>() {
            if (1..=10).contains(&rank) {
                return Some(rank);
            }
        }
    }

    None
}

/// Detect a raw (unbounded) rank directive for the write path, where
/// "#99" is a valid clamp-to-append request.
pub fn detect_write_rank(text: &str) -> Option<u32> {
    if let Some(caps) = HASH_RANK.captures(text) {
        if let Ok(rank) = caps[1].parse::<u32>() {
            if rank >= 1 {
                return Some(rank);
            }
        }
    }
    detect_ordinal_rank(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_words() {
        assert_eq!(detect_ordinal_rank("What is my second favorite crypto?"), Some(2));
        assert_eq!(detect_ordinal_rank("my tenth favorite"), Some(10));
        assert_eq!(detect_ordinal_rank("my 3rd favorite color"), Some(3));
    }

    #[test]
    fn test_hash_notation() {
        assert_eq!(detect_ordinal_rank("What's my #2 favorite crypto?"), Some(2));
        assert_eq!(detect_ordinal_rank("favorite #1"), Some(1));
    }

    #[test]
    fn test_number_and_rank_notation() {
        assert_eq!(detect_ordinal_rank("number 4 favorite"), Some(4));
        assert_eq!(detect_ordinal_rank("rank 7 entry"), Some(7));
    }

    #[test]
    fn test_whole_word_matching() {
        // "firstly" must not match "first"
        assert_eq!(detect_ordinal_rank("firstly, hello"), None);
        assert_eq!(detect_ordinal_rank("What are my favorite cryptos?"), None);
    }

    #[test]
    fn test_out_of_bounds_rank() {
        assert_eq!(detect_ordinal_rank("my #11 favorite"), None);
        assert_eq!(detect_ordinal_rank("my #99 favorite"), None);
    }

    #[test]
    fn test_write_rank_is_unbounded() {
        assert_eq!(detect_write_rank("My #99 favorite vacation destination is Morocco."), Some(99));
        assert_eq!(detect_write_rank("My #2 favorite crypto is BTC"), Some(2));
        assert_eq!(detect_write_rank("My second favorite crypto is BTC"), Some(2));
    }
}
