//! Paragraph-accumulation passage splitter.
//!
//! Turns the raw text of a book into ordered [`Passage`]s that respect a
//! `max_tokens` budget. Splitting happens on blank-line paragraph
//! boundaries; every passage records its character offsets (counted in
//! `char`s, not bytes) into the source text, so the passage text is
//! `text.chars().skip(p.start_offset).take(p.end_offset - p.start_offset)`.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Chapter headings (`Chapter 3`, `PART II`, …) flush the buffer and
//!    become passages of their own.
//! 4. Accumulate paragraphs until adding the next one would exceed
//!    `max_chars`, then flush.
//! 5. Paragraphs longer than `max_chars` are hard-split at the nearest
//!    newline or space.
//!
//! Empty or whitespace-only text produces no passages.
//!
//! ```rust
//! use relate_core::split::split_passages;
//!
//! let text = "Café society.\n\nSecond paragraph.";
//! let passages = split_passages("book-1", text, 250);
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].start_offset, 0);
//! assert_eq!(passages[0].end_offset, text.chars().count());
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::decompose::is_chapter_heading;
use crate::models::Passage;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into passages for `corpus_id`.
///
/// Passage indices are contiguous from 0 and offsets increase
/// monotonically.
pub fn split_passages(corpus_id: &str, text: &str, max_tokens: usize) -> Vec<Passage> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut buf: Option<(usize, usize)> = None;

    let mut pos = 0usize;
    for para in text.split("\n\n") {
        let para_start = pos;
        pos += para.len() + 2;

        let Some((start, end)) = trimmed_span(text, para_start, para_start + para.len()) else {
            continue;
        };
        let len = end - start;

        if is_chapter_heading(&text[start..end]) {
            spans.extend(buf.take());
            spans.push((start, end));
            continue;
        }

        if let Some((buf_start, _)) = buf {
            if start - buf_start + len > max_chars {
                spans.extend(buf.take());
            }
        }

        if len > max_chars {
            spans.extend(buf.take());
            hard_split(text, start, end, max_chars, &mut spans);
            continue;
        }

        buf = match buf {
            Some((buf_start, _)) => Some((buf_start, end)),
            None => Some((start, end)),
        };
    }
    spans.extend(buf.take());

    let offsets = char_offsets(text, &spans);
    spans
        .iter()
        .zip(offsets)
        .enumerate()
        .map(|(index, (&(start, end), chars))| {
            make_passage(corpus_id, index, &text[start..end], chars)
        })
        .collect()
}

/// Translate ascending byte spans into char spans in a single pass.
fn char_offsets(text: &str, spans: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let mut byte_pos = 0;
    let mut char_pos = 0;
    let mut to_char = |byte: usize| {
        char_pos += text[byte_pos..byte].chars().count();
        byte_pos = byte;
        char_pos
    };
    spans
        .iter()
        .map(|&(start, end)| {
            let start = to_char(start);
            (start, to_char(end))
        })
        .collect()
}

/// Shrink `[start, end)` past surrounding whitespace; `None` when empty.
fn trimmed_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return None;
    }
    Some((start + lead, end - trail))
}

/// Hard-split an oversized paragraph at newline/space boundaries.
fn hard_split(
    text: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    spans: &mut Vec<(usize, usize)>,
) {
    let mut cursor = start;
    while cursor < end {
        let remaining = &text[cursor..end];
        if remaining.len() <= max_chars {
            spans.extend(trimmed_span(text, cursor, end));
            break;
        }
        let mut cut = snap_to_char_boundary(remaining, max_chars);
        if cut == 0 {
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let actual = remaining[..cut]
            .rfind('\n')
            .or_else(|| remaining[..cut].rfind(' '))
            .map(|p| p + 1)
            .unwrap_or(cut);
        spans.extend(trimmed_span(text, cursor, cursor + actual));
        cursor += actual;
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Create a single [`Passage`] with a UUID and SHA-256 content hash.
fn make_passage(
    corpus_id: &str,
    index: usize,
    body: &str,
    (start, end): (usize, usize),
) -> Passage {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());

    Passage {
        id: Uuid::new_v4().to_string(),
        corpus_id: corpus_id.to_string(),
        index,
        text: body.to_string(),
        start_offset: start,
        end_offset: end,
        hash: format!("{:x}", hasher.finalize()),
    }
}
