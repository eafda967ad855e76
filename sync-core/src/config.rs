//! Sync core configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_PROVIDER_MAX_BYTES: u64 = 25 * 1024 * 1024;
const DEFAULT_CHUNK_TARGET_BYTES: u64 = 24 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Largest upload the transcription provider accepts, in bytes.
    #[serde(default = "default_provider_max_bytes")]
    pub provider_max_bytes: u64,

    /// Per-chunk byte target, kept safely below the provider limit.
    #[serde(default = "default_chunk_target_bytes")]
    pub chunk_target_bytes: u64,

    /// Per-chunk duration bounds in seconds.
    #[serde(default = "default_chunk_duration_min_sec")]
    pub chunk_duration_min_sec: f64,
    #[serde(default = "default_chunk_duration_max_sec")]
    pub chunk_duration_max_sec: f64,

    /// Assumed narration rate for sizing word-range audio extraction.
    #[serde(default = "default_narration_rate_wpm")]
    pub narration_rate_wpm: u32,

    /// Word count of the first progressive chunk (kept small so playback
    /// sync starts within seconds).
    #[serde(default = "default_progressive_first_chunk_words")]
    pub progressive_first_chunk_words: usize,

    /// Word count of subsequent progressive chunks.
    #[serde(default = "default_progressive_chunk_words")]
    pub progressive_chunk_words: usize,

    /// Text overlap on each side of a word chunk, in words.
    #[serde(default = "default_progressive_overlap_words")]
    pub progressive_overlap_words: usize,

    /// Schedule the next chunk when the reader is within this many words
    /// of the synced frontier.
    #[serde(default = "default_advance_threshold_words")]
    pub advance_threshold_words: usize,

    /// Length of the initial alignment probe, in seconds.
    #[serde(default = "default_initial_alignment_probe_sec")]
    pub initial_alignment_probe_sec: f64,

    /// Width of the book prefix searched by the initial probe, in words.
    #[serde(default = "default_initial_alignment_search_words")]
    pub initial_alignment_search_words: usize,

    /// Anchors at or below this confidence are dropped.
    #[serde(default = "default_anchor_confidence_floor")]
    pub anchor_confidence_floor: f64,

    /// Minimum spacing between selected anchors.
    #[serde(default = "default_anchor_min_gap_sec")]
    pub anchor_min_gap_sec: f64,
    #[serde(default = "default_anchor_min_gap_chars")]
    pub anchor_min_gap_chars: usize,

    /// Anchors closer than this in both dimensions collapse on merge.
    #[serde(default = "default_anchor_merge_window_sec")]
    pub anchor_merge_window_sec: f64,
    #[serde(default = "default_anchor_merge_window_chars")]
    pub anchor_merge_window_chars: usize,

    /// Client-side debounce for playback position reports.
    #[serde(default = "default_progress_debounce_ms")]
    pub progress_debounce_ms: u64,
}

fn default_provider_max_bytes() -> u64 {
    DEFAULT_PROVIDER_MAX_BYTES
}

fn default_chunk_target_bytes() -> u64 {
    DEFAULT_CHUNK_TARGET_BYTES
}

fn default_chunk_duration_min_sec() -> f64 {
    60.0
}

fn default_chunk_duration_max_sec() -> f64 {
    600.0
}

fn default_narration_rate_wpm() -> u32 {
    150
}

fn default_progressive_first_chunk_words() -> usize {
    75
}

fn default_progressive_chunk_words() -> usize {
    1000
}

fn default_progressive_overlap_words() -> usize {
    100
}

fn default_advance_threshold_words() -> usize {
    500
}

fn default_initial_alignment_probe_sec() -> f64 {
    45.0
}

fn default_initial_alignment_search_words() -> usize {
    5000
}

fn default_anchor_confidence_floor() -> f64 {
    0.5
}

fn default_anchor_min_gap_sec() -> f64 {
    30.0
}

fn default_anchor_min_gap_chars() -> usize {
    500
}

fn default_anchor_merge_window_sec() -> f64 {
    1.0
}

fn default_anchor_merge_window_chars() -> usize {
    10
}

fn default_progress_debounce_ms() -> u64 {
    5000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provider_max_bytes: default_provider_max_bytes(),
            chunk_target_bytes: default_chunk_target_bytes(),
            chunk_duration_min_sec: default_chunk_duration_min_sec(),
            chunk_duration_max_sec: default_chunk_duration_max_sec(),
            narration_rate_wpm: default_narration_rate_wpm(),
            progressive_first_chunk_words: default_progressive_first_chunk_words(),
            progressive_chunk_words: default_progressive_chunk_words(),
            progressive_overlap_words: default_progressive_overlap_words(),
            advance_threshold_words: default_advance_threshold_words(),
            initial_alignment_probe_sec: default_initial_alignment_probe_sec(),
            initial_alignment_search_words: default_initial_alignment_search_words(),
            anchor_confidence_floor: default_anchor_confidence_floor(),
            anchor_min_gap_sec: default_anchor_min_gap_sec(),
            anchor_min_gap_chars: default_anchor_min_gap_chars(),
            anchor_merge_window_sec: default_anchor_merge_window_sec(),
            anchor_merge_window_chars: default_anchor_merge_window_chars(),
            progress_debounce_ms: default_progress_debounce_ms(),
        }
    }
}

impl SyncConfig {
    /// Load config from a TOML file, returning defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Seconds of audio that cover `words` at the configured narration rate.
    pub fn seconds_for_words(&self, words: usize) -> f64 {
        words as f64 / self.narration_rate_wpm as f64 * 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.provider_max_bytes, 25 * 1024 * 1024);
        assert_eq!(config.chunk_target_bytes, 24 * 1024 * 1024);
        assert_eq!(config.chunk_duration_min_sec, 60.0);
        assert_eq!(config.chunk_duration_max_sec, 600.0);
        assert_eq!(config.narration_rate_wpm, 150);
        assert_eq!(config.progressive_first_chunk_words, 75);
        assert_eq!(config.progressive_chunk_words, 1000);
        assert_eq!(config.progressive_overlap_words, 100);
        assert_eq!(config.advance_threshold_words, 500);
        assert_eq!(config.initial_alignment_probe_sec, 45.0);
        assert_eq!(config.initial_alignment_search_words, 5000);
        assert_eq!(config.anchor_confidence_floor, 0.5);
        assert_eq!(config.anchor_min_gap_sec, 30.0);
        assert_eq!(config.anchor_min_gap_chars, 500);
        assert_eq!(config.anchor_merge_window_sec, 1.0);
        assert_eq!(config.anchor_merge_window_chars, 10);
        assert_eq!(config.progress_debounce_ms, 5000);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
narration_rate_wpm = 170
progressive_chunk_words = 500
"#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.narration_rate_wpm, 170);
        assert_eq!(config.progressive_chunk_words, 500);
        // Untouched fields keep defaults
        assert_eq!(config.advance_threshold_words, 500);
    }

    #[test]
    fn test_seconds_for_words() {
        let config = SyncConfig::default();
        // 150 words at 150 wpm is one minute
        assert!((config.seconds_for_words(150) - 60.0).abs() < 1e-9);
        assert!((config.seconds_for_words(1000) - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = SyncConfig::load_from(Path::new("/nonexistent/sync.toml")).unwrap();
        assert_eq!(config.progressive_first_chunk_words, 75);
    }
}
