//! Chunk planning: service-sized slices that prefer paragraph edges over hard cuts.

use crate::paragraph::Paragraph;
use crate::text::CharIndex;
use serde::{Deserialize, Serialize};

/// A contiguous slice `[start, end)` (chars) of the planned text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Progress estimate only: `ceil(text_chars / max_chunk_chars)`.
///
/// Boundary-aware planning can produce more chunks than this.
pub fn estimate_chunk_count(text_chars: usize, max_chunk_chars: usize) -> usize {
    if max_chunk_chars == 0 {
        return 0;
    }
    text_chars.div_ceil(max_chunk_chars)
}

/// Plan chunks covering all of `text` with no gap and no overlap.
///
/// `paragraphs` must be the index of this same `text`. Every chunk is at most
/// `max_chunk_chars` long; a paragraph is split only when it alone exceeds the budget.
pub fn plan_chunks(text: &str, paragraphs: &[Paragraph], max_chunk_chars: usize) -> Vec<Chunk> {
    let idx = CharIndex::new(text);
    let len = idx.char_len();
    let max = max_chunk_chars.max(1);

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < len {
        let ideal = start + max;
        let end = if ideal >= len {
            len
        } else {
            boundary_before(start, ideal, len, paragraphs)
        };
        out.push(Chunk {
            start,
            end,
            text: text[idx.byte_of(start)..idx.byte_of(end)].to_string(),
        });
        start = end;
    }
    out
}

/// Pick the end of a chunk that starts at `start` and may not pass `ideal`.
///
/// Always returns a value in `(start, ideal]`.
fn boundary_before(start: usize, ideal: usize, len: usize, paragraphs: &[Paragraph]) -> usize {
    let mut best = None;
    for (i, p) in paragraphs.iter().enumerate() {
        if p.start > ideal {
            break;
        }
        if p.end > start && p.end <= ideal {
            // Take the delimiter gap after the paragraph too, so the next chunk opens on
            // the next paragraph's first char.
            let gap_end = paragraphs.get(i + 1).map_or(len, |n| n.start);
            best = Some(gap_end.min(ideal));
        }
    }
    if let Some(b) = best {
        return b;
    }
    // Nothing fits whole. Cut in front of the next paragraph if there is room before it,
    // otherwise hard-truncate.
    match paragraphs.iter().find(|p| p.end > start) {
        Some(p) if p.start > start => p.start.min(ideal),
        _ => ideal,
    }
}
