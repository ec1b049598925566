//! Paragraph index over `\n`-joined extracted text.

use serde::{Deserialize, Serialize};

/// A non-blank line of the source text with its absolute char range `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Paragraph {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Paragraph {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, pos: usize) -> bool {
        self.start <= pos && pos < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParagraphIndex {
    paragraphs: Vec<Paragraph>,
    text_chars: usize,
}

impl ParagraphIndex {
    /// Split on `\n`. Blank pieces (empty after trim) advance the offset but are not recorded.
    pub fn build(text: &str) -> Self {
        let mut paragraphs = Vec::new();
        let mut pos = 0usize;
        for piece in text.split('\n') {
            let n = piece.chars().count();
            if !piece.trim().is_empty() {
                paragraphs.push(Paragraph {
                    index: paragraphs.len(),
                    start: pos,
                    end: pos + n,
                    text: piece.to_string(),
                });
            }
            // The removed line break.
            pos += n + 1;
        }
        Self {
            paragraphs,
            text_chars: pos.saturating_sub(1),
        }
    }

    pub fn paragraphs(&self) -> &[Paragraph] {
        &self.paragraphs
    }

    pub fn into_paragraphs(self) -> Vec<Paragraph> {
        self.paragraphs
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    /// Length of the indexed text in chars.
    pub fn text_chars(&self) -> usize {
        self.text_chars
    }

    /// The paragraph whose `[start, end)` contains `pos`.
    ///
    /// `None` for positions in a gap (line breaks, blank lines, past the end). Callers leave
    /// such tokens unassigned; this is never "paragraph 0".
    pub fn find_by_position(&self, pos: usize) -> Option<usize> {
        find_paragraph_by_position(&self.paragraphs, pos)
    }
}

/// Lookup over a sorted paragraph table (as produced by [`ParagraphIndex::build`]).
pub fn find_paragraph_by_position(paragraphs: &[Paragraph], pos: usize) -> Option<usize> {
    let i = paragraphs.partition_point(|p| p.end <= pos);
    paragraphs.get(i).filter(|p| p.contains(pos)).map(|p| p.index)
}
