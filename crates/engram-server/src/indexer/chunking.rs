// crates/engram-server/src/indexer/chunking.rs
// Chat-message chunking for embedding generation

use sha2::{Digest, Sha256};

/// Approximate tokens per character.
const TOKENS_PER_CHAR: f64 = 0.25;
/// Sliding-window chunk size in tokens.
const CHUNK_SIZE_TOKENS: usize = 512;
/// Overlap between consecutive chunks, in tokens.
const CHUNK_OVERLAP_TOKENS: usize = 64;
/// Messages at or under this estimated token count stay one chunk.
const SINGLE_CHUNK_THRESHOLD_TOKENS: f64 = 1000.0;
/// Chunks shorter than this after trimming are dropped.
const MIN_CHUNK_CHARS: usize = 10;

/// One chunk of a message, with exact character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub chunk_index: u32,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
}

/// Estimated token count for a text (≈ 4 chars/token).
pub fn estimate_tokens(text: &str) -> f64 {
    text.chars().count() as f64 * TOKENS_PER_CHAR
}

/// Estimated chunk count, used for queue timeout computation.
pub fn estimate_chunks(text: &str) -> usize {
    std::cmp::max(1, text.chars().count() / 1000 + 1)
}

/// Split a chat message into chunks.
///
/// Short messages (≤ ~1000 estimated tokens) become a single chunk.
/// Longer ones use a sliding window of ~512 tokens with ~64-token
/// overlap, preferring sentence boundaries ("`. `") within the window,
/// then line breaks, then hard cuts. Offsets are character offsets into
/// the original text.
pub fn chunk_chat_message(text: &str) -> Vec<ChatChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let text_len = chars.len();

    if estimate_tokens(text) <= SINGLE_CHUNK_THRESHOLD_TOKENS {
        let trimmed = text.trim();
        if trimmed.chars().count() <= MIN_CHUNK_CHARS {
            return Vec::new();
        }
        return vec![ChatChunk {
            chunk_index: 0,
            text: text.to_string(),
            start_char: 0,
            end_char: text_len,
        }];
    }

    let chunk_size_chars = (CHUNK_SIZE_TOKENS as f64 / TOKENS_PER_CHAR) as usize; // ~2048
    let overlap_chars = (CHUNK_OVERLAP_TOKENS as f64 / TOKENS_PER_CHAR) as usize; // ~256

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_index = 0u32;

    while start < text_len {
        let mut end = std::cmp::min(start + chunk_size_chars, text_len);

        if end < text_len {
            // Prefer a sentence boundary within the window
            if let Some(sentence_end) = rfind_seq(&chars, start, end, &['.', ' ']) {
                if sentence_end > start + 100 {
                    end = sentence_end + 2;
                } else if let Some(line_break) = rfind_char(&chars, start, end, '\n') {
                    if line_break > start + 100 {
                        end = line_break + 1;
                    }
                }
            } else if let Some(line_break) = rfind_char(&chars, start, end, '\n') {
                if line_break > start + 100 {
                    end = line_break + 1;
                }
            }
        }

        let chunk_text: String = chars[start..end].iter().collect();
        let trimmed = chunk_text.trim();
        if trimmed.chars().count() > MIN_CHUNK_CHARS {
            chunks.push(ChatChunk {
                chunk_index,
                text: trimmed.to_string(),
                start_char: start,
                end_char: end,
            });
            chunk_index += 1;
        }

        // Advance with overlap, always making progress
        let mut new_start = std::cmp::max(start + 1, end.saturating_sub(overlap_chars));
        if new_start <= start {
            new_start = start + chunk_size_chars / 2;
        }
        start = new_start;
    }

    chunks
}

/// Content fingerprint over the trimmed chunk bytes: a 64-bit prefix of
/// SHA-256, hex-encoded. Reproducible across runs and platforms.
pub fn chunk_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.trim().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Drop duplicate chunks within one message (by content fingerprint).
pub fn dedup_chunks(chunks: Vec<ChatChunk>) -> Vec<ChatChunk> {
    let mut seen = std::collections::HashSet::new();
    chunks
        .into_iter()
        .filter(|chunk| seen.insert(chunk_fingerprint(&chunk.text)))
        .collect()
}

/// Last index in `[start, end)` where `needle` begins in `haystack`.
fn rfind_seq(haystack: &[char], start: usize, end: usize, needle: &[char]) -> Option<usize> {
    if needle.is_empty() || end < needle.len() {
        return None;
    }
    let upper = std::cmp::min(end, haystack.len());
    let mut i = upper.saturating_sub(needle.len());
    loop {
        if i < start {
            return None;
        }
        if haystack[i..i + needle.len()] == *needle {
            return Some(i);
        }
        if i == 0 {
            return None;
        }
        i -= 1;
    }
}

/// Last index in `[start, end)` of `needle` in `haystack`.
fn rfind_char(haystack: &[char], start: usize, end: usize, needle: char) -> Option<usize> {
    let upper = std::cmp::min(end, haystack.len());
    haystack[start..upper]
        .iter()
        .rposition(|c| *c == needle)
        .map(|pos| start + pos)
}
