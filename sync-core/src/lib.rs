//! Core engine for syncing ebook text with audiobook narration.
//!
//! The pipeline: parse the book archive into paragraph-preserving plain
//! text, segment the audio into transcription-ready chunks, transcribe
//! them, fuzzy-match transcripts against the text, and maintain the
//! resulting time-to-text anchor curve on a sync session. Sessions run
//! eagerly over the whole book or progressively, one word window at a
//! time, staying just ahead of the reader.
//!
//! Storage (session records, blobs) and transcription are capability
//! traits with pluggable backends so the whole engine runs against
//! in-memory fakes in tests.

pub mod align;
pub mod audio;
pub mod blob;
pub mod book;
pub mod config;
pub mod error;
pub mod store;
pub mod sync;

pub use align::{Anchor, merge_anchors, position_at, select_anchors};
pub use audio::{AudioChunk, AudioFormat, AudioSegmenter, ChunkOptions, FfmpegSegmenter};
pub use blob::{BlobStore, LocalBlobStore};
pub use book::{Chapter, ParsedBook, parse_epub};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use store::{
    AudiobookRecord, BookRecord, MemoryStore, SessionStatus, SessionStore, SyncMode, SyncSession,
    SyncStep,
};
pub use sync::{SyncOrchestrator, WordMap};
