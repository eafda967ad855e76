//! Anchor selection, merging, and time-to-text interpolation.
//!
//! An anchor asserts that at `audio_time` seconds the narrator is at byte
//! position `char_index` of the book's plain text. A selected anchor set,
//! sorted by time, forms the sync curve that playback queries against.

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Seconds from the start of the audiobook.
    pub audio_time: f64,
    /// Byte offset into the book's plain text.
    pub char_index: usize,
    /// Match confidence in (0, 1].
    pub confidence: f64,
}

impl Anchor {
    pub fn new(audio_time: f64, char_index: usize, confidence: f64) -> Self {
        Self {
            audio_time,
            char_index,
            confidence,
        }
    }
}

/// Reduce raw aligner output to a well-spaced anchor set covering the whole
/// audio range, endpoints synthesized when the real anchors leave a gap.
pub fn select_anchors(
    raw: &[Anchor],
    total_duration: f64,
    text_len: usize,
    config: &SyncConfig,
) -> Vec<Anchor> {
    // Highest confidence first; ties resolved by earlier time so the
    // selection is deterministic.
    let mut by_confidence: Vec<Anchor> = raw.to_vec();
    by_confidence.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.audio_time.total_cmp(&b.audio_time))
            .then(a.char_index.cmp(&b.char_index))
    });

    let mut accepted: Vec<Anchor> = Vec::new();
    for candidate in by_confidence {
        let far_enough = accepted.iter().all(|a| {
            (candidate.audio_time - a.audio_time).abs() >= config.anchor_min_gap_sec
                && candidate.char_index.abs_diff(a.char_index) >= config.anchor_min_gap_chars
        });
        if far_enough {
            accepted.push(candidate);
        }
    }

    accepted.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));

    let needs_head = accepted.first().map_or(true, |a| a.audio_time > 5.0);
    if needs_head {
        accepted.insert(0, Anchor::new(0.0, 0, 1.0));
    }
    let needs_tail = accepted
        .last()
        .map_or(true, |a| a.audio_time < total_duration - 30.0);
    if needs_tail {
        accepted.push(Anchor::new(total_duration, text_len, 1.0));
    }

    accepted
}

/// Merge two anchor sets into one time-ordered set, collapsing any pair
/// that lands within the merge window in both dimensions. The higher
/// confidence wins; on equal confidence the earlier time wins.
pub fn merge_anchors(existing: &[Anchor], incoming: &[Anchor], config: &SyncConfig) -> Vec<Anchor> {
    let mut union: Vec<Anchor> = existing.iter().chain(incoming.iter()).copied().collect();
    union.sort_by(|a, b| {
        a.audio_time
            .total_cmp(&b.audio_time)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.char_index.cmp(&b.char_index))
    });

    let mut merged: Vec<Anchor> = Vec::with_capacity(union.len());
    for candidate in union {
        match merged.last_mut() {
            Some(last)
                if (candidate.audio_time - last.audio_time).abs()
                    < config.anchor_merge_window_sec
                    && candidate.char_index.abs_diff(last.char_index)
                        < config.anchor_merge_window_chars =>
            {
                if candidate.confidence > last.confidence {
                    *last = candidate;
                }
            }
            _ => merged.push(candidate),
        }
    }
    merged
}

/// Text position for audio time `t`, by linear interpolation between the
/// bracketing anchors. `anchors` must be sorted by `audio_time`.
pub fn position_at(anchors: &[Anchor], t: f64) -> usize {
    match anchors {
        [] => 0,
        [only] => only.char_index,
        _ => {
            let first = anchors[0];
            let last = anchors[anchors.len() - 1];
            if t <= first.audio_time {
                return first.char_index;
            }
            if t >= last.audio_time {
                return last.char_index;
            }
            // Index of the first anchor past t; its predecessor brackets t.
            let upper = anchors
                .partition_point(|a| a.audio_time <= t)
                .clamp(1, anchors.len() - 1);
            let a = anchors[upper - 1];
            let b = anchors[upper];
            let span = b.audio_time - a.audio_time;
            if span <= f64::EPSILON {
                return a.char_index;
            }
            let fraction = (t - a.audio_time) / span;
            let delta = b.char_index as f64 - a.char_index as f64;
            (a.char_index as f64 + fraction * delta).round() as usize
        }
    }
}
