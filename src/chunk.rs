//! Paragraph-boundary text chunker with optional overlap.
//!
//! Splits text into [`Chunk`]s that respect a configurable `max_tokens`
//! limit. Splitting occurs on paragraph boundaries (`\n\n`) where possible;
//! oversized paragraphs are hard-split at the nearest newline or space.
//!
//! With `overlap_tokens > 0`, every chunk after the first is prefixed with the
//! tail of its predecessor, cut at a word boundary, so that sentences spanning
//! a split remain retrievable from either side.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Returns chunks with contiguous indices starting at 0. Empty or
/// whitespace-only text yields no chunks.
pub fn chunk_text(source: &str, text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens.min(max_tokens.saturating_sub(1)) * CHARS_PER_TOKEN;

    let pieces = split_pieces(text, max_chars);

    let mut chunks = Vec::with_capacity(pieces.len());
    let mut previous: Option<&str> = None;
    for (index, piece) in pieces.iter().enumerate() {
        let body = match previous {
            Some(prev) if overlap_chars > 0 => {
                let tail = overlap_tail(prev, overlap_chars);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{} {}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        chunks.push(make_chunk(source, index as i64, &body));
        previous = Some(piece);
    }

    chunks
}

/// Non-overlapping pieces of at most `max_chars` bytes each.
fn split_pieces(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .filter(|pos| *pos > 0)
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at.max(next_char_len(remaining)))
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}

/// The last `max_chars` bytes of `text`, starting at a word boundary.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let start = ceil_char_boundary(text, text.len() - max_chars);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn next_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(0)
}

fn make_chunk(source: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        source: source.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
