//! Overlapping, boundary-preferring text chunker.
//!
//! Splits a document body into [`Chunk`]s of at most `max_tokens` (converted
//! to characters) with `overlap_tokens` of shared text between consecutive
//! chunks. Every chunk is an exact byte span of the body, so the de-overlapped
//! concatenation of all chunks reconstructs the body with no gaps.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` / `overlap_tokens` to characters (× 4).
//! 2. Collect natural boundaries: paragraph starts after a blank line, and
//!    heading lines (`#`).
//! 3. From the current start, end the chunk at the furthest natural boundary
//!    that fits. Without one, fall back to the last newline, then the last
//!    space, then a hard cut on a UTF-8 character boundary.
//! 4. Start the next chunk `overlap` characters before the previous end,
//!    nudged forward to a word start. The overlap is capped at half the
//!    previous chunk so every step makes progress.
//! 5. A body that fits in one chunk (including an empty body) yields exactly
//!    one chunk.
//!
//! # Example
//!
//! ```rust
//! use babytrack_rag::chunk::{chunk_text, ChunkPolicy};
//!
//! let policy = ChunkPolicy::new(700, 80);
//! let chunks = chunk_text("doc.md", "Hello world.\n\nSecond paragraph.", policy);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunk sizing, in bytes of UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl ChunkPolicy {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
            overlap_chars: overlap_tokens * CHARS_PER_TOKEN,
        }
    }
}

impl From<&ChunkingConfig> for ChunkPolicy {
    fn from(config: &ChunkingConfig) -> Self {
        Self::new(config.max_tokens, config.overlap_tokens)
    }
}

/// Chunk a document's body.
pub fn chunk_document(doc: &Document, policy: ChunkPolicy) -> Vec<Chunk> {
    chunk_text(&doc.id, &doc.body, policy)
}

/// Split text into overlapping chunks with contiguous ordinals from 0.
pub fn chunk_text(document_id: &str, text: &str, policy: ChunkPolicy) -> Vec<Chunk> {
    let len = text.len();
    let headings = heading_offsets(text);

    if len <= policy.max_chars {
        return vec![make_chunk(document_id, 0, text, 0, len, &headings)];
    }

    let boundaries = natural_boundaries(text);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut prev_end = 0usize;
    let mut ordinal = 0u32;

    loop {
        let end = if len - start <= policy.max_chars {
            len
        } else {
            choose_end(text, start, prev_end, policy.max_chars, &boundaries)
        };

        chunks.push(make_chunk(document_id, ordinal, text, start, end, &headings));
        ordinal += 1;

        if end >= len {
            break;
        }

        let overlap = policy.overlap_chars.min((end - start) / 2);
        start = next_start(text, start, end, overlap);
        prev_end = end;
    }

    chunks
}

/// Pick the end offset of a chunk starting at `start`.
fn choose_end(
    text: &str,
    start: usize,
    prev_end: usize,
    max_chars: usize,
    boundaries: &[usize],
) -> usize {
    let limit = floor_char_boundary(text, start + max_chars);
    // Never end inside the previous chunk, and avoid slivers.
    let min_end = (prev_end + 1).max(start + max_chars / 4);

    let idx = boundaries.partition_point(|&b| b <= limit);
    if idx > 0 && boundaries[idx - 1] >= min_end {
        return boundaries[idx - 1];
    }

    let window = &text[start..limit];
    for sep in ['\n', ' '] {
        if let Some(pos) = window.rfind(sep) {
            let end = start + pos + 1;
            if end >= min_end {
                return end;
            }
        }
    }

    limit
}

fn next_start(text: &str, start: usize, end: usize, overlap: usize) -> usize {
    let mut candidate = ceil_char_boundary(text, end - overlap);
    if overlap > 0 && candidate >= end {
        // Rounding up skipped the whole overlap; step back a character instead.
        candidate = floor_char_boundary(text, end - overlap);
    }
    if candidate < end {
        if let Some((pos, ch)) = text[candidate..end]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
        {
            let word_start = candidate + pos + ch.len_utf8();
            if word_start < end {
                candidate = word_start;
            }
        }
    }
    candidate.max(ceil_char_boundary(text, start + 1))
}

/// Byte offsets where a new paragraph or heading begins.
fn natural_boundaries(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    let mut prev_blank = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if offset > 0 && !blank && (prev_blank || line.starts_with('#')) {
            out.push(offset);
        }
        prev_blank = blank;
        offset += line.len();
    }
    out
}

/// `(offset, heading text)` for every markdown heading line.
fn heading_offsets(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if line.starts_with('#') {
            let title = line.trim_start_matches('#').trim();
            if !title.is_empty() {
                out.push((offset, title.to_string()));
            }
        }
        offset += line.len();
    }
    out
}

fn section_at(headings: &[(usize, String)], start: usize) -> Option<String> {
    let idx = headings.partition_point(|(off, _)| *off <= start);
    if idx == 0 {
        None
    } else {
        Some(headings[idx - 1].1.clone())
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn make_chunk(
    document_id: &str,
    ordinal: u32,
    text: &str,
    start: usize,
    end: usize,
    headings: &[(usize, String)],
) -> Chunk {
    let span = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(span.as_bytes());

    Chunk {
        document_id: document_id.to_string(),
        ordinal,
        start,
        end,
        section: section_at(headings, start),
        text: span.to_string(),
        hash: hex::encode(hasher.finalize()),
    }
}
