//! Persistence surface for books, audiobooks, and sync sessions.
//!
//! Every operation takes the acting owner and verifies it against the
//! stored record; mismatches fail with `Unauthorized`. Session updates go
//! through `update_session`, which applies a patch atomically and stamps
//! `updated_at`.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::align::Anchor;
use crate::audio::AudioFormat;
use crate::book::{AnnotatedChapter, Chapter, ParsedBook};
use crate::error::Result;

pub use memory::MemoryStore;

/// SHA-256 of `bytes` as lowercase hex. Content identity for dedup.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub author: Option<String>,
    pub filename: String,
    /// Canonical plain text; immutable once created.
    pub plain_text: String,
    pub chapters: Vec<Chapter>,
    pub annotated_chapters: Option<Vec<AnnotatedChapter>>,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookRecord {
    pub fn total_words(&self) -> usize {
        self.plain_text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudiobookRecord {
    pub id: String,
    pub owner: String,
    pub title: Option<String>,
    pub filename: String,
    pub duration_sec: f64,
    pub format: AudioFormat,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Processing,
    Paused,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStep {
    Extracting,
    Segmenting,
    Transcribing,
    Matching,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Progressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub owner: String,
    pub book_id: String,
    pub audio_id: String,
    pub status: SessionStatus,
    pub current_step: SyncStep,
    /// Pipeline progress in percent.
    pub progress: u8,
    pub sync_mode: SyncMode,
    pub word_chunk_size: usize,
    /// Largest word index covered by sync so far; never decreases.
    pub synced_up_to_word: usize,
    pub total_chunks: usize,
    pub current_chunk: usize,
    /// Time-ordered sync curve.
    pub sync_anchors: Vec<Anchor>,
    /// Client-supplied version for playback checkpoints; never decreases.
    pub progress_version: u64,
    pub playback_position_sec: f64,
    /// Playback position in percent of the audiobook duration.
    pub playback_progress: f64,
    pub playback_updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBook {
    pub owner: String,
    pub title: String,
    pub author: Option<String>,
    pub filename: String,
    pub plain_text: String,
    pub chapters: Vec<Chapter>,
    pub annotated_chapters: Option<Vec<AnnotatedChapter>>,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
}

impl NewBook {
    /// Build a record from a parsed archive plus its storage identity.
    pub fn from_parsed(
        owner: impl Into<String>,
        book: ParsedBook,
        filename: impl Into<String>,
        blob_path: impl Into<String>,
        content_hash: impl Into<String>,
        byte_size: u64,
    ) -> Self {
        Self {
            owner: owner.into(),
            title: book.title,
            author: book.author,
            filename: filename.into(),
            plain_text: book.plain_text,
            chapters: book.chapters,
            annotated_chapters: Some(book.annotated_chapters),
            blob_path: blob_path.into(),
            content_hash: content_hash.into(),
            byte_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAudiobook {
    pub owner: String,
    pub title: Option<String>,
    pub filename: String,
    pub duration_sec: f64,
    pub format: AudioFormat,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner: String,
    pub book_id: String,
    pub audio_id: String,
    pub sync_mode: SyncMode,
    /// Defaults to 1000 words when unset.
    pub word_chunk_size: Option<usize>,
}

/// Fields a re-parse may change. Plain text is immutable; only the
/// annotated display form and the title can be refreshed.
#[derive(Debug, Clone, Default)]
pub struct BookPatch {
    pub title: Option<String>,
    pub annotated_chapters: Option<Vec<AnnotatedChapter>>,
}

#[derive(Debug, Clone, Default)]
pub struct AudiobookPatch {
    pub title: Option<String>,
}

/// Atomic session update. Unset fields are left alone; `error` uses a
/// double Option so it can be cleared.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub current_step: Option<SyncStep>,
    pub progress: Option<u8>,
    pub synced_up_to_word: Option<usize>,
    pub total_chunks: Option<usize>,
    pub current_chunk: Option<usize>,
    pub sync_anchors: Option<Vec<Anchor>>,
    pub progress_version: Option<u64>,
    pub playback_position_sec: Option<f64>,
    pub playback_progress: Option<f64>,
    pub error: Option<Option<String>>,
}

/// Narrow persistence interface the orchestrator drives. Backends must
/// verify ownership on every call and keep `update_session` atomic per
/// session row.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a book, or return the existing record when one with the
    /// same `(owner, content_hash)` already exists.
    async fn create_book(&self, new: NewBook) -> Result<BookRecord>;
    async fn find_book_by_hash(&self, owner: &str, hash: &str) -> Result<Option<BookRecord>>;
    async fn get_book(&self, owner: &str, id: &str) -> Result<BookRecord>;
    async fn update_book(&self, owner: &str, id: &str, patch: BookPatch) -> Result<BookRecord>;
    /// Delete a book and every sync session referencing it.
    async fn delete_book(&self, owner: &str, id: &str) -> Result<()>;
    async fn list_books(&self, owner: &str) -> Result<Vec<BookRecord>>;

    /// Deduplicating create, as for books.
    async fn create_audiobook(&self, new: NewAudiobook) -> Result<AudiobookRecord>;
    async fn find_audiobook_by_hash(
        &self,
        owner: &str,
        hash: &str,
    ) -> Result<Option<AudiobookRecord>>;
    async fn get_audiobook(&self, owner: &str, id: &str) -> Result<AudiobookRecord>;
    async fn update_audiobook(
        &self,
        owner: &str,
        id: &str,
        patch: AudiobookPatch,
    ) -> Result<AudiobookRecord>;
    /// Delete an audiobook and every sync session referencing it.
    async fn delete_audiobook(&self, owner: &str, id: &str) -> Result<()>;
    async fn list_audiobooks(&self, owner: &str) -> Result<Vec<AudiobookRecord>>;

    /// Create a session, or return the live session already pairing the
    /// same book and audiobook for this owner.
    async fn create_session(&self, new: NewSession) -> Result<SyncSession>;
    async fn get_session(&self, owner: &str, id: &str) -> Result<SyncSession>;
    async fn update_session(
        &self,
        owner: &str,
        id: &str,
        patch: SessionPatch,
    ) -> Result<SyncSession>;
    async fn find_session_by_pair(
        &self,
        owner: &str,
        book_id: &str,
        audio_id: &str,
    ) -> Result<Option<SyncSession>>;
    async fn list_sessions(&self, owner: &str) -> Result<Vec<SyncSession>>;
    async fn delete_session(&self, owner: &str, id: &str) -> Result<()>;
    async fn delete_sessions_by_book(&self, owner: &str, book_id: &str) -> Result<()>;
    async fn delete_sessions_by_audiobook(&self, owner: &str, audio_id: &str) -> Result<()>;
}
