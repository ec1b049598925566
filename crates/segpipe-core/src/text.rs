//! Char/byte offset mapping.
//!
//! Public offsets are char counts; `str` searching works on bytes. `CharIndex` records the
//! byte offset of every char boundary so both directions are O(1) / O(log n).

#[derive(Debug, Clone)]
pub struct CharIndex {
    /// `bounds[i]` is the byte offset of char `i`; the last entry is `text.len()`.
    bounds: Vec<usize>,
}

impl CharIndex {
    pub fn new(text: &str) -> Self {
        let mut bounds: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        bounds.push(text.len());
        Self { bounds }
    }

    pub fn char_len(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Byte offset of char `c`, clamped to the end of the text.
    pub fn byte_of(&self, c: usize) -> usize {
        self.bounds[c.min(self.char_len())]
    }

    /// Char index of a byte offset that lies on a char boundary.
    ///
    /// Offsets inside a multi-byte char round down to the char that contains them.
    pub fn char_of(&self, byte: usize) -> usize {
        match self.bounds.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }
}

/// Slice `text` by char offsets (`[start, end)`), clamped to the text.
pub fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    let idx = CharIndex::new(text);
    let (s, e) = (idx.byte_of(start), idx.byte_of(end.max(start)));
    &text[s..e]
}
