//! Sliding-window fuzzy search of transcript fragments over book text.
//!
//! The book text is cut into overlapping word windows; each transcript
//! fragment is scored against every window with a normalized edit
//! distance, and the best-scoring window becomes an anchor candidate.

use strsim::normalized_levenshtein;

use crate::align::anchors::Anchor;
use crate::config::SyncConfig;

/// Window size in words.
const WINDOW_WORDS: usize = 50;
/// Window stride in words.
const STRIDE_WORDS: usize = 25;
/// Fragments shorter than this (trimmed) are skipped.
const MIN_FRAGMENT_CHARS: usize = 10;
/// Minimum overlapping characters for a match to count.
const MIN_OVERLAP_CHARS: usize = 10;
/// Largest acceptable normalized edit distance.
const MAX_SCORE: f64 = 0.4;

/// A piece of transcript text with its absolute audio timestamp.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Seconds from the start of the audiobook.
    pub timestamp: f64,
    pub text: String,
}

impl Fragment {
    pub fn new(timestamp: f64, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }
}

/// A located match of a fragment within the text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMatch {
    /// Byte offset of the matched window in the searched text.
    pub char_index: usize,
    /// 1 − score; higher is better.
    pub confidence: f64,
}

struct Window {
    /// Byte offset of the window start in the source text.
    offset: usize,
    /// Normalized words inside the window.
    norm_words: Vec<String>,
}

/// Pre-built window set over one text slice, reusable across fragments.
pub struct WindowIndex {
    windows: Vec<Window>,
}

impl WindowIndex {
    pub fn new(text: &str) -> Self {
        let offsets = word_offsets(text);
        let mut windows = Vec::new();
        let mut start = 0;
        while start < offsets.len() {
            let end = (start + WINDOW_WORDS).min(offsets.len());
            let norm_words = offsets[start..end]
                .iter()
                .map(|&(s, e)| normalize(&text[s..e]))
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>();
            if !norm_words.is_empty() {
                windows.push(Window {
                    offset: offsets[start].0,
                    norm_words,
                });
            }
            if end == offsets.len() {
                break;
            }
            start += STRIDE_WORDS;
        }
        Self { windows }
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Best window for `fragment`, or None when nothing clears the
    /// distance threshold and overlap minimum.
    pub fn best_match(&self, fragment: &str) -> Option<WindowMatch> {
        let norm_fragment = normalize(fragment);
        if norm_fragment.len() < MIN_OVERLAP_CHARS {
            return None;
        }
        let fragment_words = norm_fragment.split(' ').count();

        let mut best: Option<WindowMatch> = None;
        for window in &self.windows {
            let Some(score) = window_score(window, &norm_fragment, fragment_words) else {
                continue;
            };
            if score > MAX_SCORE {
                continue;
            }
            let confidence = 1.0 - score;
            if best.map_or(true, |b| confidence > b.confidence) {
                best = Some(WindowMatch {
                    char_index: window.offset,
                    confidence,
                });
            }
        }
        best
    }
}

/// Best normalized edit distance between the fragment and any run of
/// `fragment_words` consecutive words in the window.
fn window_score(window: &Window, norm_fragment: &str, fragment_words: usize) -> Option<f64> {
    let run_len = fragment_words.min(window.norm_words.len());
    if run_len == 0 {
        return None;
    }

    let mut best: Option<f64> = None;
    for start in 0..=(window.norm_words.len() - run_len) {
        let run = window.norm_words[start..start + run_len].join(" ");
        if run.len() < MIN_OVERLAP_CHARS {
            continue;
        }
        let score = 1.0 - normalized_levenshtein(norm_fragment, &run);
        if best.map_or(true, |b| score < b) {
            best = Some(score);
        }
    }
    best
}

/// Lowercase, strip punctuation, collapse whitespace. Transcripts and book
/// text disagree on case and punctuation; comparison happens in this form.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if c.is_whitespace() || c == '\'' || c == '\u{2019}' {
            // Apostrophes vanish rather than split words ("don't" -> "dont").
            if c.is_whitespace() && !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Byte ranges of whitespace-separated words.
fn word_offsets(text: &str) -> Vec<(usize, usize)> {
    let mut offsets = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                offsets.push((start, i));
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(start) = word_start {
        offsets.push((start, text.len()));
    }
    offsets
}

/// Match every fragment against `text` and return anchors sorted by audio
/// time. Deterministic: identical inputs yield identical anchors.
pub fn align_fragments(text: &str, fragments: &[Fragment], config: &SyncConfig) -> Vec<Anchor> {
    let index = WindowIndex::new(text);
    if index.is_empty() {
        return Vec::new();
    }

    let mut anchors: Vec<Anchor> = Vec::new();
    for fragment in fragments {
        if fragment.text.trim().len() < MIN_FRAGMENT_CHARS {
            continue;
        }
        let Some(found) = index.best_match(&fragment.text) else {
            continue;
        };
        if found.confidence <= config.anchor_confidence_floor {
            continue;
        }
        anchors.push(Anchor::new(
            fragment.timestamp,
            found.char_index,
            found.confidence,
        ));
    }

    anchors.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));
    anchors
}
