//! Structure-aware page segmenter.
//!
//! Splits one page of extracted text into [`Chunk`]s whose offsets point
//! back into the page. Legal prose is usually organised by explicit
//! markers, so the segmenter tries a fixed list of split patterns from the
//! most structural to the least and keeps the first one that actually
//! divides the page:
//!
//! 1. section markers (`Section 4`, `§ 12`, `ARTICLE IV`)
//! 2. decimal subsections at line start (`1.2`, `3.4.1`)
//! 3. parenthetical markers at line start (`(a)`, `(12)`, `(iv)`)
//! 4. blank-line paragraph breaks
//! 5. sentence-ending punctuation
//!
//! If none of them yields more than one non-empty segment the whole page
//! is a single segment. Any segment longer than `max_chunk_length` is then
//! cut with a fixed sliding window of `chunk_size` characters advancing by
//! `chunk_size - chunk_overlap`; the last window is clipped to the segment.
//!
//! Offsets and lengths count Unicode scalar values, never bytes, and are
//! measured against the untouched page text, so they are non-decreasing
//! across a page.
//!
//! # Example
//!
//! ```rust
//! use docket::config::ChunkingConfig;
//! use docket::segment::Segmenter;
//!
//! let segmenter = Segmenter::new(ChunkingConfig::default()).unwrap();
//! let chunks = segmenter.segment_page("doc-1", 1, "First clause.\n\nSecond clause.");
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].start_offset, 15);
//! ```

use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::models::Chunk;

/// Where a pattern match divides the text.
#[derive(Debug, Clone, Copy)]
enum Cut {
    /// The match opens the next segment (a heading marker).
    BeforeMatch,
    /// The match closes the current segment (a delimiter).
    AfterMatch,
}

#[derive(Debug)]
struct SplitPattern {
    name: &'static str,
    regex: Regex,
    cut: Cut,
}

const PATTERNS: &[(&str, &str, Cut)] = &[
    (
        "section",
        r"(?m)^[ \t]*(?:§+[ \t]*\d+|(?i:section)[ \t]+\d+|(?i:article)[ \t]+(?:[IVXLC]+|\d+)\b)",
        Cut::BeforeMatch,
    ),
    (
        "subsection",
        r"(?m)^[ \t]*\d+\.\d+(?:\.\d+)*\b",
        Cut::BeforeMatch,
    ),
    (
        "parenthetical",
        r"(?m)^[ \t]*\((?:[a-z]|[ivxlc]+|\d+)\)",
        Cut::BeforeMatch,
    ),
    ("paragraph", r"\n[ \t]*\n\s*", Cut::AfterMatch),
    ("sentence", r#"[.!?]+["')\]]*\s+"#, Cut::AfterMatch),
];

/// Splits page text into offset-tracked chunks.
#[derive(Debug)]
pub struct Segmenter {
    config: ChunkingConfig,
    patterns: Vec<SplitPattern>,
}

impl Segmenter {
    /// Build a segmenter, rejecting configurations whose sliding window
    /// could not advance.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        let patterns = PATTERNS
            .iter()
            .map(|(name, pattern, cut)| {
                Regex::new(pattern)
                    .map(|regex| SplitPattern {
                        name,
                        regex,
                        cut: *cut,
                    })
                    .map_err(|e| Error::Config(format!("split pattern {}: {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, patterns })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Segment one page. `page` is 1-based. Returned chunks carry
    /// page-local `chunk_index` values starting at 0 and empty embeddings.
    pub fn segment_page(&self, document_id: &str, page: u32, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut cursor = CharCursor::default();

        for (start, end) in self.split_structural(text) {
            let (start, end) = trim_range(text, start, end);
            if start == end {
                continue;
            }
            let segment = &text[start..end];
            let seg_char_start = cursor.advance_to(text, start);
            let seg_len = segment.chars().count();

            if seg_len <= self.config.max_chunk_length {
                chunks.push(make_chunk(
                    document_id,
                    chunks.len() as i64,
                    page,
                    segment,
                    seg_char_start,
                    seg_char_start + seg_len,
                ));
                continue;
            }

            for (w_start, w_end) in window_bounds(seg_len, &self.config) {
                let piece = slice_chars(segment, w_start, w_end);
                chunks.push(make_chunk(
                    document_id,
                    chunks.len() as i64,
                    page,
                    piece,
                    seg_char_start + w_start,
                    seg_char_start + w_end,
                ));
            }
        }

        chunks
    }

    /// Byte ranges of the segments produced by the first pattern that
    /// divides the page, or the whole page.
    fn split_structural(&self, text: &str) -> Vec<(usize, usize)> {
        for pattern in &self.patterns {
            let ranges = split_by(text, pattern);
            let non_empty = ranges
                .iter()
                .filter(|(s, e)| !text[*s..*e].trim().is_empty())
                .count();
            if non_empty > 1 {
                tracing::trace!(pattern = pattern.name, segments = non_empty, "split page");
                return ranges;
            }
        }
        vec![(0, text.len())]
    }
}

fn split_by(text: &str, pattern: &SplitPattern) -> Vec<(usize, usize)> {
    let mut cuts: Vec<usize> = pattern
        .regex
        .find_iter(text)
        .map(|m| match pattern.cut {
            Cut::BeforeMatch => m.start(),
            Cut::AfterMatch => m.end(),
        })
        .filter(|&pos| pos > 0 && pos < text.len())
        .collect();
    cuts.dedup();

    let mut ranges = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        ranges.push((start, cut));
        start = cut;
    }
    ranges.push((start, text.len()));
    ranges
}

/// Sliding windows `[start, end)` in characters over a segment of
/// `len` characters. Consecutive windows share exactly `chunk_overlap`
/// characters; the final window ends at `len`.
pub fn window_bounds(len: usize, config: &ChunkingConfig) -> Vec<(usize, usize)> {
    let stride = config.chunk_size - config.chunk_overlap;
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(len);
        windows.push((start, end));
        if end >= len {
            break;
        }
        start += stride;
    }
    windows
}

/// Shrink a byte range to exclude surrounding whitespace.
fn trim_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    (start + lead, start + lead + trimmed.len())
}

/// Substring by character positions.
fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    let mut indices = s.char_indices().map(|(i, _)| i).chain(std::iter::once(s.len()));
    let from = indices.nth(start).unwrap_or(s.len());
    let to = if end > start {
        indices.nth(end - start - 1).unwrap_or(s.len())
    } else {
        from
    };
    &s[from..to]
}

/// Converts monotonically increasing byte positions to char positions.
#[derive(Default)]
struct CharCursor {
    byte: usize,
    chars: usize,
}

impl CharCursor {
    fn advance_to(&mut self, text: &str, byte: usize) -> usize {
        self.chars += text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// Create a single [`Chunk`] with a UUID and SHA-256 content hash.
fn make_chunk(
    document_id: &str,
    index: i64,
    page: u32,
    text: &str,
    start_offset: usize,
    end_offset: usize,
) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        page,
        text: text.to_string(),
        hash: hash_text(text),
        embedding: Vec::new(),
        start_offset,
        end_offset,
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
