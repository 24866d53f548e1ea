//! Email body normalization and overlapping word-count chunking.
//!
//! Cleaning strips signature blocks and quoted reply chains with
//! line-prefix and marker-phrase heuristics, then collapses whitespace.
//! Chunking splits the cleaned text into spans of `chunk_words` words with
//! `overlap_words` words of overlap; a non-empty body shorter than one
//! chunk yields exactly one chunk, and empty bodies yield none.

use crate::config::ChunkingConfig;
use crate::models::ChunkRecord;

/// Closing phrases that start a signature block.
const CLOSING_PHRASES: &[&str] = &[
    "best regards",
    "kind regards",
    "warm regards",
    "regards",
    "sincerely",
    "thanks",
    "thank you",
    "best",
];

/// How many trailing lines a closing phrase may appear in and still be
/// treated as a signature rather than body text.
const SIGNATURE_WINDOW: usize = 6;

/// Clean a raw message body: drop quoted reply chains, cut the signature,
/// and collapse whitespace.
pub fn clean_body(body: &str) -> String {
    let unquoted = strip_quoted(body);
    let unsigned = strip_signature(&unquoted);
    collapse_whitespace(&unsigned)
}

/// Drop quoted reply/forward content. Everything from the first chain
/// marker onward is discarded, and `>`-prefixed lines are skipped.
fn strip_quoted(text: &str) -> String {
    let mut kept = Vec::new();
    for line in text.lines() {
        let lower = line.trim().to_lowercase();
        let chain_marker = (lower.starts_with("on ") && lower.contains(" wrote:"))
            || lower.starts_with("from:")
            || lower.starts_with("sent:")
            || lower.contains("-----original message-----")
            || lower.contains("begin forwarded message")
            || lower.starts_with("________");
        if chain_marker {
            break;
        }
        if line.trim_start().starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Cut the signature: a `--` delimiter line anywhere, or a closing phrase
/// within the last few lines.
fn strip_signature(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let mut cut = lines.len();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == "--" || trimmed == "—" {
            cut = i;
            break;
        }
    }

    let window_start = cut.saturating_sub(SIGNATURE_WINDOW);
    for (i, line) in lines[..cut].iter().enumerate().skip(window_start) {
        let normalized = line
            .trim()
            .trim_end_matches([',', '.', '!'])
            .to_lowercase();
        if CLOSING_PHRASES.contains(&normalized.as_str()) {
            cut = i;
            break;
        }
    }

    lines[..cut].join("\n")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if squeezed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&squeezed);
    }
    out.trim().to_string()
}

/// Split text into overlapping word-count chunks.
///
/// For a text of `L` words with chunk size `C` and overlap `O < C`, this
/// produces `ceil((L - O) / (C - O))` chunks when `L > C`, else exactly
/// one. Concatenating the chunks with the first `O` words of every chunk
/// after the first removed reconstructs the original word sequence.
pub fn chunk_words(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    if words.len() <= chunk_size {
        return vec![words.join(" ")];
    }

    let stride = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }
        start += stride;
    }
    chunks
}

/// Clean one message body and produce its chunk records.
///
/// Chunk ids are `"{message_id}:{index}"`, unique per run because message
/// ids are. Scores are zeroed; the ranking stage fills them in later.
pub fn normalize_message(
    message_id: &str,
    body: &str,
    config: &ChunkingConfig,
) -> Vec<ChunkRecord> {
    let cleaned = clean_body(body);
    chunk_words(&cleaned, config.chunk_words, config.overlap_words)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let token_count = text.split_whitespace().count() as i64;
            ChunkRecord {
                chunk_id: format!("{}:{}", message_id, index),
                message_id: message_id.to_string(),
                index: index as i64,
                token_count,
                text,
                lexical_score: 0.0,
                vector_score: 0.0,
                rerank_score: 0.0,
                selected: false,
            }
        })
        .collect()
}
