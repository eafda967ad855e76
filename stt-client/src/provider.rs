use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single transcribed segment with timing relative to the start of the
/// submitted audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    /// The transcribed text.
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Full result of transcribing one piece of audio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcription {
    /// Concatenated transcript text.
    pub text: String,
    /// Audio duration in seconds, when the provider reports it.
    pub duration: Option<f64>,
    /// Timestamped segments in order.
    pub segments: Vec<TranscriptSegment>,
}

impl Transcription {
    /// Build a transcription from segments, concatenating their text.
    pub fn from_segments(segments: Vec<TranscriptSegment>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            text,
            duration: None,
            segments,
        }
    }

    /// Duration of the audio, falling back to the end of the last segment
    /// when the provider omits it.
    pub fn duration_or_last_segment(&self) -> Option<f64> {
        self.duration.or_else(|| self.segments.last().map(|s| s.end))
    }
}

/// Trait for speech-to-text providers.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Transcribe the audio file at `path`. `format` is the container
    /// extension ("mp3", "wav", ...). No retries are performed here; the
    /// caller decides retry policy.
    async fn transcribe(&self, path: &Path, format: &str) -> Result<Transcription>;

    /// Provider name for display.
    fn name(&self) -> &'static str;

    /// Largest upload the provider accepts, in bytes.
    fn max_upload_bytes(&self) -> u64;

    /// Check if the provider is usable (API key set, etc.)
    fn is_available(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_segments_concatenates_text() {
        let t = Transcription::from_segments(vec![
            TranscriptSegment::new(0.0, 2.0, " Hello "),
            TranscriptSegment::new(2.0, 4.0, "world."),
        ]);
        assert_eq!(t.text, "Hello world.");
        assert_eq!(t.segments.len(), 2);
    }

    #[test]
    fn test_duration_falls_back_to_last_segment() {
        let mut t = Transcription::from_segments(vec![
            TranscriptSegment::new(0.0, 2.0, "a"),
            TranscriptSegment::new(2.0, 7.5, "b"),
        ]);
        assert_eq!(t.duration_or_last_segment(), Some(7.5));

        t.duration = Some(8.0);
        assert_eq!(t.duration_or_last_segment(), Some(8.0));
    }

    #[test]
    fn test_duration_none_without_segments() {
        let t = Transcription::default();
        assert_eq!(t.duration_or_last_segment(), None);
    }
}
