//! Audio probing and segmentation.

pub mod chunker;
pub mod probe;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use chunker::FfmpegSegmenter;
pub use probe::AudioInfo;

/// Accepted audio container/codec families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    M4a,
    M4b,
    Wav,
    Ogg,
}

impl AudioFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" => Some(AudioFormat::M4a),
            "m4b" => Some(AudioFormat::M4b),
            "wav" => Some(AudioFormat::Wav),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::M4b => "m4b",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
        }
    }

    /// Whether the transcription provider accepts this container natively.
    /// M4B must be re-encoded first.
    pub fn provider_accepted(&self) -> bool {
        !matches!(self, AudioFormat::M4b)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// One transcription-ready piece of audio. Transient: lives for a single
/// transcription attempt and is always released afterwards.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub path: PathBuf,
    /// Offset of this chunk within the source audio, in seconds.
    pub start_time: f64,
    pub duration: f64,
    pub byte_size: u64,
    pub format: AudioFormat,
    /// Set when the chunk was uploaded to the blob store (the local copy
    /// is gone).
    pub blob_key: Option<String>,
    /// Whether the segmenter created the file at `path`. Passthrough
    /// chunks point at the caller's source file and are never deleted.
    pub owned: bool,
}

/// Segmentation options for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOptions {
    /// Cap the first chunk of re-encoded formats so progressive sessions
    /// start quickly.
    pub progressive: bool,
    /// Upload each chunk to the blob store and drop the local copy.
    pub use_blob_store: bool,
}

/// Capability surface for audio segmentation, so pipelines can run
/// against a stub in tests.
#[async_trait]
pub trait AudioSegmenter: Send + Sync {
    /// Split `source` into chunks each below the configured byte target,
    /// in strictly increasing start-time order.
    async fn chunk_file(
        &self,
        session_id: &str,
        source: &Path,
        format: AudioFormat,
        options: ChunkOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<AudioChunk>>;

    /// Extract `[start_sec, start_sec + duration_sec)` as a single chunk
    /// named after `label`.
    async fn extract_range(
        &self,
        session_id: &str,
        source: &Path,
        format: AudioFormat,
        start_sec: f64,
        duration_sec: f64,
        label: &str,
    ) -> Result<AudioChunk>;

    /// Release every chunk (blob object or local file) and the session
    /// working directory. Idempotent.
    async fn cleanup(&self, session_id: &str, chunks: &[AudioChunk]) -> Result<()>;
}
