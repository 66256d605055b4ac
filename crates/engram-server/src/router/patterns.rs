// crates/engram-server/src/router/patterns.rs
// Deterministic pre-parse override for strong favorite patterns
//
// When one of these patterns matches, the dispatcher builds the routing
// plan itself and the router model is never consulted. These plans are
// exact by construction, so routing for them is reproducible regardless
// of model behavior.

use engram_types::{
    ContentPlane, FactValue, FactsReadCandidate, FactsWriteCandidate, Operation, PlanCandidate,
    RankSpec, RouteSource, RoutingPlan,
};
use once_cell::sync::Lazy;
use regex::Regex;

use super::ordinal::{detect_ordinal_rank, detect_write_rank};

const ORDINAL_TOKEN: &str = r"#\d+|\d+(?:st|nd|rd|th)|first|second|third|fourth|fifth|sixth|seventh|eighth|ninth|tenth|number\s+\d+";

static WRITE_RANKED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*my\s+({ORDINAL_TOKEN})\s+favorite\s+(.+?)\s+(?:is|are)\s+(.+?)\s*$"
    ))
    .expect("static regex")
});
static WRITE_PLAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*my\s+favorite\s+(.+?)\s+(?:is|are)\s+(.+?)\s*$").expect("static regex")
});
static READ_LAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*what(?:'s|\s+is)\s+my\s+last\s+favorite\s+(.+?)[\s?.!]*$")
        .expect("static regex")
});
static READ_ORDINAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*what(?:'s|\s+is)\s+my\s+({ORDINAL_TOKEN})\s+favorite\s+(.+?)[\s?.!]*$"
    ))
    .expect("static regex")
});
static READ_SINGLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*what(?:'s|\s+is)\s+my\s+favorite\s+(.+?)[\s?.!]*$").expect("static regex")
});
static READ_PLURAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*what\s+are\s+my\s+favorite\s+(.+?)[\s?.!]*$").expect("static regex")
});
static READ_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:please\s+)?(?:list|show)(?:\s+in\s+order)?\s+my\s+favorite\s+(.+?)[\s?.!]*$")
        .expect("static regex")
});
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}[.)]\s*").expect("static regex"));

/// Match the message against the strong patterns; returns a complete
/// routing plan on a hit.
pub fn match_override(message: &str) -> Option<RoutingPlan> {
    if let Some(caps) = WRITE_RANKED.captures(message) {
        let rank = detect_write_rank(&caps[1])?;
        let topic = caps[2].trim().to_string();
        let value = clean_value(&caps[3]);
        if topic.is_empty() || value.is_empty() {
            return None;
        }
        let why = format!("Favorite rank directive detected: #{rank} {topic} = {value}");
        return Some(write_plan(
            FactsWriteCandidate {
                topic,
                value: FactValue::One(value),
                rank_ordered: false,
                rank: Some(rank),
            },
            why,
        ));
    }

    if let Some(caps) = WRITE_PLAIN.captures(message) {
        let topic = caps[1].trim().to_string();
        let values = split_values(&caps[2]);
        if topic.is_empty() || values.is_empty() {
            return None;
        }
        let why = format!("My favorite pattern detected: {topic} = {values:?}");
        let rank_ordered = values.len() > 1;
        let value = if values.len() == 1 {
            FactValue::One(values.into_iter().next().unwrap_or_default())
        } else {
            FactValue::Many(values)
        };
        return Some(write_plan(
            FactsWriteCandidate {
                topic,
                value,
                rank_ordered,
                rank: None,
            },
            why,
        ));
    }

    if let Some(caps) = READ_LAST.captures(message) {
        let topic = caps[1].trim().to_string();
        let why = format!("Facts ordinal query: last favorite {topic}");
        return Some(read_plan(topic, message, Some(RankSpec::Last), why));
    }

    if let Some(caps) = READ_ORDINAL.captures(message) {
        // Read-path ranks are bounded; out-of-bounds ordinals are not a
        // strong pattern and fall through to the model.
        let rank = detect_ordinal_rank(&caps[1])?;
        let topic = caps[2].trim().to_string();
        let why = format!("Facts ordinal query: #{rank} favorite {topic}");
        return Some(read_plan(topic, message, Some(RankSpec::Nth(rank)), why));
    }

    for re in [&*READ_PLURAL, &*READ_SINGLE, &*READ_LIST] {
        if let Some(caps) = re.captures(message) {
            let topic = caps[1].trim().to_string();
            let why = format!("Facts read query for {topic}");
            return Some(read_plan(topic, message, None, why));
        }
    }

    None
}

fn write_plan(candidate: FactsWriteCandidate, why: String) -> RoutingPlan {
    RoutingPlan {
        content_plane: ContentPlane::Facts,
        operation: Operation::Write,
        reasoning_required: false,
        candidate: PlanCandidate::FactsWrite(candidate),
        confidence: 1.0,
        why,
        source: RouteSource::Override,
    }
}

fn read_plan(topic: String, query: &str, rank: Option<RankSpec>, why: String) -> RoutingPlan {
    RoutingPlan {
        content_plane: ContentPlane::Facts,
        operation: Operation::Read,
        reasoning_required: false,
        candidate: PlanCandidate::FactsRead(FactsReadCandidate {
            topic,
            query: query.to_string(),
            rank,
        }),
        confidence: 1.0,
        why,
        source: RouteSource::Override,
    }
}

fn clean_value(raw: &str) -> String {
    raw.trim().trim_end_matches(['.', '!']).trim().to_string()
}

/// Split a bulk value expression into ordered values.
///
/// Handles comma lists, "and" joins, and numbered lists
/// ("1) XMR, 2) BTC, and 3) XLM").
fn split_values(raw: &str) -> Vec<String> {
    let cleaned = clean_value(raw);
    let without_markers = LIST_MARKER.replace_all(&cleaned, "");
    let joined = without_markers
        .replace(", and ", ", ")
        .replace(" and ", ", ");
    joined
        .split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}
