//! Error taxonomy for the sync core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid book archive: {0}")]
    InvalidArchive(String),

    #[error("asset not found in archive: {0}")]
    AssetMissing(String),

    #[error("audio chunk {index} is {size} bytes, over the {limit} byte limit")]
    ChunkTooLarge { index: usize, size: u64, limit: u64 },

    #[error("audio tool failed: {0}")]
    AudioTool(String),

    #[error("transcription failed: {0}")]
    Transcription(#[from] stt_client::SttError),

    #[error("no alignment anchors above the confidence floor")]
    AlignmentEmpty,

    #[error("not authorized to access {0}")]
    Unauthorized(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl SyncError {
    /// Shorthand for a missing record of the given kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error should be persisted as a session error message.
    /// Cancellation is silent: the session row is left as-is.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
