//! EPUB parsing and chapter text extraction.

mod html;
mod parser;

use serde::{Deserialize, Serialize};

pub use parser::{MIN_CHAPTER_CHARS, parse_epub};

/// A chapter's position within the book's plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    /// Byte offset of the chapter start in the plain text.
    pub start_char: usize,
    /// Byte offset one past the chapter end.
    pub end_char: usize,
    /// Whitespace-token count of the chapter slice.
    pub word_count: usize,
}

/// A chapter rendered as standalone HTML with every asset inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedChapter {
    pub title: String,
    pub html: String,
}

/// Parsed EPUB book.
#[derive(Debug, Clone)]
pub struct ParsedBook {
    pub title: String,
    pub author: Option<String>,
    /// Canonical text, paragraph breaks preserved as blank lines.
    pub plain_text: String,
    /// Chapters in reading order, covering a prefix of `plain_text`.
    pub chapters: Vec<Chapter>,
    /// Display form of each kept chapter, parallel to `chapters`.
    pub annotated_chapters: Vec<AnnotatedChapter>,
}

impl ParsedBook {
    /// Total word count of the plain text.
    pub fn total_words(&self) -> usize {
        self.plain_text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_words() {
        let book = ParsedBook {
            title: "T".to_string(),
            author: None,
            plain_text: "one two three\n\nfour five".to_string(),
            chapters: Vec::new(),
            annotated_chapters: Vec::new(),
        };
        assert_eq!(book.total_words(), 5);
    }
}
