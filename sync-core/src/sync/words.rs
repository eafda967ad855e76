//! Word-to-character index map over a book's plain text.
//!
//! Progressive sync addresses the book in words (chunk boundaries,
//! frontier) but the aligner and anchors address it in byte offsets; this
//! map converts between the two in O(log n).

/// Byte offsets of every whitespace-separated word, built once per text.
#[derive(Debug, Clone)]
pub struct WordMap {
    starts: Vec<usize>,
    ends: Vec<usize>,
    text_len: usize,
}

impl WordMap {
    pub fn new(text: &str) -> Self {
        let mut starts = Vec::new();
        let mut ends = Vec::new();
        let mut word_start: Option<usize> = None;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                if let Some(start) = word_start.take() {
                    starts.push(start);
                    ends.push(i);
                }
            } else if word_start.is_none() {
                word_start = Some(i);
            }
        }
        if let Some(start) = word_start {
            starts.push(start);
            ends.push(text.len());
        }
        Self {
            starts,
            ends,
            text_len: text.len(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn text_len(&self) -> usize {
        self.text_len
    }

    /// Byte offset where word `index` starts; `None` past the end.
    pub fn start_of(&self, index: usize) -> Option<usize> {
        self.starts.get(index).copied()
    }

    /// Byte range covering words `[word_start, word_start + word_count)`,
    /// clamped to the text. `None` when the clamped range is empty.
    pub fn char_range(&self, word_start: usize, word_count: usize) -> Option<(usize, usize)> {
        if word_start >= self.starts.len() || word_count == 0 {
            return None;
        }
        let end_word = (word_start + word_count).min(self.starts.len());
        Some((self.starts[word_start], self.ends[end_word - 1]))
    }

    /// As `char_range`, widened by `overlap` words on each side.
    pub fn char_range_with_overlap(
        &self,
        word_start: usize,
        word_count: usize,
        overlap: usize,
    ) -> Option<(usize, usize)> {
        if word_start >= self.starts.len() || word_count == 0 {
            return None;
        }
        let from = word_start.saturating_sub(overlap);
        let to = word_start + word_count + overlap;
        self.char_range(from, to - from)
    }

    /// Index of the word containing `char_index`, or the nearest word
    /// before it. Positions before the first word map to word 0.
    pub fn word_at_char(&self, char_index: usize) -> usize {
        let after = self.starts.partition_point(|&s| s <= char_index);
        after.saturating_sub(1)
    }
}
