//! Offset reconciliation: attach absolute positions and paragraph indices to provider tokens.
//!
//! Matching is deliberately the simple cursor heuristic: each token is searched for in its
//! chunk starting at the end of the previous match, and the first occurrence wins. Repeated
//! words therefore resolve to the first unconsumed occurrence.

use crate::chunk::Chunk;
use crate::paragraph::{find_paragraph_by_position, Paragraph};
use crate::text::CharIndex;
use crate::{RawItem, Token};

/// Position the tokens returned for one chunk.
///
/// `chunk.start` is the chunk's offset in the text that `paragraphs` indexes. Tokens with no
/// match keep `start`/`end`/`paragraph_index` as `None` and are not dropped.
pub fn reconcile_chunk(chunk: &Chunk, items: Vec<RawItem>, paragraphs: &[Paragraph]) -> Vec<Token> {
    let idx = CharIndex::new(&chunk.text);
    // Byte cursor into chunk.text; never moves backwards.
    let mut cursor = 0usize;
    let mut out = Vec::with_capacity(items.len());
    for raw in items {
        let mut tok = Token::unpositioned(raw);
        if tok.text.is_empty() {
            out.push(tok);
            continue;
        }
        if let Some(rel) = chunk.text[cursor..].find(tok.text.as_str()) {
            let byte = cursor + rel;
            cursor = byte + tok.text.len();
            let local = idx.char_of(byte);
            let start = chunk.start + local;
            tok.start = Some(start);
            tok.end = Some(start + tok.text.chars().count());
            tok.paragraph_index = find_paragraph_by_position(paragraphs, start);
        }
        out.push(tok);
    }
    out
}

/// Shift remainder-relative tokens into the coordinates of the full text.
///
/// Paragraph indices are recomputed from the shifted offset against the full-text
/// paragraph table; the remainder-relative index is discarded.
pub fn rebase(tokens: &mut [Token], offset: usize, paragraphs: &[Paragraph]) {
    for tok in tokens.iter_mut() {
        match (tok.start, tok.end) {
            (Some(s), Some(e)) => {
                let s = s + offset;
                tok.start = Some(s);
                tok.end = Some(e + offset);
                tok.paragraph_index = find_paragraph_by_position(paragraphs, s);
            }
            _ => tok.paragraph_index = None,
        }
    }
}

/// Final pass over the merged token list.
///
/// - drops empty and whitespace-only tokens
/// - fills in a missing paragraph index for positioned tokens
/// - for unpositioned tokens, takes the first occurrence anywhere in `text`
///
/// Returns how many tokens were dropped.
pub fn complete_positions(tokens: &mut Vec<Token>, text: &str, paragraphs: &[Paragraph]) -> usize {
    let before = tokens.len();
    tokens.retain(|t| !t.is_blank());
    let dropped = before - tokens.len();

    let mut idx: Option<CharIndex> = None;
    for tok in tokens.iter_mut() {
        if let Some(start) = tok.start {
            if tok.paragraph_index.is_none() {
                tok.paragraph_index = find_paragraph_by_position(paragraphs, start);
            }
            continue;
        }
        let Some(byte) = text.find(tok.text.as_str()) else {
            continue;
        };
        let idx = idx.get_or_insert_with(|| CharIndex::new(text));
        let start = idx.char_of(byte);
        tok.start = Some(start);
        tok.end = Some(start + tok.text.chars().count());
        tok.paragraph_index = find_paragraph_by_position(paragraphs, start);
    }
    dropped
}
