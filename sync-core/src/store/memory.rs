//! In-memory session store backend, for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AudiobookPatch, AudiobookRecord, BookPatch, BookRecord, NewAudiobook, NewBook, NewSession,
    SessionPatch, SessionStatus, SessionStore, SyncSession, SyncStep,
};
use crate::error::{Result, SyncError};

const DEFAULT_WORD_CHUNK_SIZE: usize = 1000;

#[derive(Default)]
struct Inner {
    books: HashMap<String, BookRecord>,
    audiobooks: HashMap<String, AudiobookRecord>,
    sessions: HashMap<String, SyncSession>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }
}

/// HashMap-backed store guarded by a single mutex; every trait method is
/// one critical section, which makes `update_session` atomic per row.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_owner(actual: &str, expected: &str, kind: &'static str, id: &str) -> Result<()> {
    if actual != expected {
        return Err(SyncError::Unauthorized(format!("{} {}", kind, id)));
    }
    Ok(())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_book(&self, new: NewBook) -> Result<BookRecord> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .books
            .values()
            .find(|b| b.owner == new.owner && b.content_hash == new.content_hash)
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let id = inner.next_id("book");
        let record = BookRecord {
            id: id.clone(),
            owner: new.owner,
            title: new.title,
            author: new.author,
            filename: new.filename,
            plain_text: new.plain_text,
            chapters: new.chapters,
            annotated_chapters: new.annotated_chapters,
            blob_path: new.blob_path,
            content_hash: new.content_hash,
            byte_size: new.byte_size,
            created_at: now,
            updated_at: now,
        };
        inner.books.insert(id, record.clone());
        Ok(record)
    }

    async fn find_book_by_hash(&self, owner: &str, hash: &str) -> Result<Option<BookRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .books
            .values()
            .find(|b| b.owner == owner && b.content_hash == hash)
            .cloned())
    }

    async fn get_book(&self, owner: &str, id: &str) -> Result<BookRecord> {
        let inner = self.inner.lock().unwrap();
        let book = inner
            .books
            .get(id)
            .ok_or_else(|| SyncError::not_found("book", id))?;
        check_owner(&book.owner, owner, "book", id)?;
        Ok(book.clone())
    }

    async fn update_book(&self, owner: &str, id: &str, patch: BookPatch) -> Result<BookRecord> {
        let mut inner = self.inner.lock().unwrap();
        let book = inner
            .books
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("book", id))?;
        check_owner(&book.owner, owner, "book", id)?;
        if let Some(title) = patch.title {
            book.title = title;
        }
        if let Some(annotated) = patch.annotated_chapters {
            book.annotated_chapters = Some(annotated);
        }
        book.updated_at = Utc::now();
        Ok(book.clone())
    }

    async fn delete_book(&self, owner: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let book = inner
            .books
            .get(id)
            .ok_or_else(|| SyncError::not_found("book", id))?;
        check_owner(&book.owner, owner, "book", id)?;
        inner.books.remove(id);
        inner.sessions.retain(|_, s| s.book_id != id);
        Ok(())
    }

    async fn list_books(&self, owner: &str) -> Result<Vec<BookRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut books: Vec<BookRecord> = inner
            .books
            .values()
            .filter(|b| b.owner == owner)
            .cloned()
            .collect();
        books.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(books)
    }

    async fn create_audiobook(&self, new: NewAudiobook) -> Result<AudiobookRecord> {
        if !(new.duration_sec > 0.0) {
            return Err(SyncError::Invariant(format!(
                "audiobook duration must be positive, got {}",
                new.duration_sec
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .audiobooks
            .values()
            .find(|a| a.owner == new.owner && a.content_hash == new.content_hash)
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let id = inner.next_id("audio");
        let record = AudiobookRecord {
            id: id.clone(),
            owner: new.owner,
            title: new.title,
            filename: new.filename,
            duration_sec: new.duration_sec,
            format: new.format,
            blob_path: new.blob_path,
            content_hash: new.content_hash,
            byte_size: new.byte_size,
            created_at: now,
            updated_at: now,
        };
        inner.audiobooks.insert(id, record.clone());
        Ok(record)
    }

    async fn find_audiobook_by_hash(
        &self,
        owner: &str,
        hash: &str,
    ) -> Result<Option<AudiobookRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .audiobooks
            .values()
            .find(|a| a.owner == owner && a.content_hash == hash)
            .cloned())
    }

    async fn get_audiobook(&self, owner: &str, id: &str) -> Result<AudiobookRecord> {
        let inner = self.inner.lock().unwrap();
        let audio = inner
            .audiobooks
            .get(id)
            .ok_or_else(|| SyncError::not_found("audiobook", id))?;
        check_owner(&audio.owner, owner, "audiobook", id)?;
        Ok(audio.clone())
    }

    async fn update_audiobook(
        &self,
        owner: &str,
        id: &str,
        patch: AudiobookPatch,
    ) -> Result<AudiobookRecord> {
        let mut inner = self.inner.lock().unwrap();
        let audio = inner
            .audiobooks
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("audiobook", id))?;
        check_owner(&audio.owner, owner, "audiobook", id)?;
        if let Some(title) = patch.title {
            audio.title = Some(title);
        }
        audio.updated_at = Utc::now();
        Ok(audio.clone())
    }

    async fn delete_audiobook(&self, owner: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let audio = inner
            .audiobooks
            .get(id)
            .ok_or_else(|| SyncError::not_found("audiobook", id))?;
        check_owner(&audio.owner, owner, "audiobook", id)?;
        inner.audiobooks.remove(id);
        inner.sessions.retain(|_, s| s.audio_id != id);
        Ok(())
    }

    async fn list_audiobooks(&self, owner: &str) -> Result<Vec<AudiobookRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut audiobooks: Vec<AudiobookRecord> = inner
            .audiobooks
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        audiobooks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(audiobooks)
    }

    async fn create_session(&self, new: NewSession) -> Result<SyncSession> {
        let mut inner = self.inner.lock().unwrap();

        let book = inner
            .books
            .get(&new.book_id)
            .ok_or_else(|| SyncError::not_found("book", &new.book_id))?;
        check_owner(&book.owner, &new.owner, "book", &new.book_id)?;
        let audio = inner
            .audiobooks
            .get(&new.audio_id)
            .ok_or_else(|| SyncError::not_found("audiobook", &new.audio_id))?;
        check_owner(&audio.owner, &new.owner, "audiobook", &new.audio_id)?;

        // One live session per (book, audio, owner).
        if let Some(existing) = inner.sessions.values().find(|s| {
            s.owner == new.owner && s.book_id == new.book_id && s.audio_id == new.audio_id
        }) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let id = inner.next_id("sess");
        let session = SyncSession {
            id: id.clone(),
            owner: new.owner,
            book_id: new.book_id,
            audio_id: new.audio_id,
            status: SessionStatus::Pending,
            current_step: SyncStep::Extracting,
            progress: 0,
            sync_mode: new.sync_mode,
            word_chunk_size: new.word_chunk_size.unwrap_or(DEFAULT_WORD_CHUNK_SIZE),
            synced_up_to_word: 0,
            total_chunks: 0,
            current_chunk: 0,
            sync_anchors: Vec::new(),
            progress_version: 0,
            playback_position_sec: 0.0,
            playback_progress: 0.0,
            playback_updated_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, owner: &str, id: &str) -> Result<SyncSession> {
        let inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| SyncError::not_found("session", id))?;
        check_owner(&session.owner, owner, "session", id)?;
        Ok(session.clone())
    }

    async fn update_session(
        &self,
        owner: &str,
        id: &str,
        patch: SessionPatch,
    ) -> Result<SyncSession> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found("session", id))?;
        check_owner(&session.owner, owner, "session", id)?;

        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(step) = patch.current_step {
            session.current_step = step;
        }
        if let Some(progress) = patch.progress {
            session.progress = progress.min(100);
        }
        if let Some(synced) = patch.synced_up_to_word {
            // Monotone: the frontier never moves backwards.
            session.synced_up_to_word = session.synced_up_to_word.max(synced);
        }
        if let Some(total_chunks) = patch.total_chunks {
            session.total_chunks = total_chunks;
        }
        if let Some(current_chunk) = patch.current_chunk {
            session.current_chunk = current_chunk;
        }
        if let Some(anchors) = patch.sync_anchors {
            session.sync_anchors = anchors;
        }
        if let Some(version) = patch.progress_version {
            // Monotone: stale versions never overwrite newer ones.
            if version > session.progress_version {
                session.progress_version = version;
            }
        }
        if let Some(position) = patch.playback_position_sec {
            session.playback_position_sec = position;
            session.playback_updated_at = Some(Utc::now());
        }
        if let Some(progress) = patch.playback_progress {
            session.playback_progress = progress.clamp(0.0, 100.0);
        }
        if let Some(error) = patch.error {
            session.error = error;
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn find_session_by_pair(
        &self,
        owner: &str,
        book_id: &str,
        audio_id: &str,
    ) -> Result<Option<SyncSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .find(|s| s.owner == owner && s.book_id == book_id && s.audio_id == audio_id)
            .cloned())
    }

    async fn list_sessions(&self, owner: &str) -> Result<Vec<SyncSession>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<SyncSession> = inner
            .sessions
            .values()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn delete_session(&self, owner: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| SyncError::not_found("session", id))?;
        check_owner(&session.owner, owner, "session", id)?;
        inner.sessions.remove(id);
        Ok(())
    }

    async fn delete_sessions_by_book(&self, owner: &str, book_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .retain(|_, s| !(s.owner == owner && s.book_id == book_id));
        Ok(())
    }

    async fn delete_sessions_by_audiobook(&self, owner: &str, audio_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .retain(|_, s| !(s.owner == owner && s.audio_id == audio_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::store::sha256_hex;

    fn new_book(owner: &str, text: &str) -> NewBook {
        NewBook {
            owner: owner.to_string(),
            title: "Book".to_string(),
            author: None,
            filename: "book.epub".to_string(),
            plain_text: text.to_string(),
            chapters: Vec::new(),
            annotated_chapters: None,
            blob_path: "books/b".to_string(),
            content_hash: sha256_hex(text.as_bytes()),
            byte_size: text.len() as u64,
        }
    }

    fn new_audiobook(owner: &str, hash: &str) -> NewAudiobook {
        NewAudiobook {
            owner: owner.to_string(),
            title: None,
            filename: "book.mp3".to_string(),
            duration_sec: 3600.0,
            format: AudioFormat::Mp3,
            blob_path: "audio/a".to_string(),
            content_hash: hash.to_string(),
            byte_size: 1000,
        }
    }

    async fn seeded_session(store: &MemoryStore, owner: &str) -> SyncSession {
        let book = store.create_book(new_book(owner, "some text")).await.unwrap();
        let audio = store
            .create_audiobook(new_audiobook(owner, "h1"))
            .await
            .unwrap();
        store
            .create_session(NewSession {
                owner: owner.to_string(),
                book_id: book.id,
                audio_id: audio.id,
                sync_mode: SyncMode::Full,
                word_chunk_size: None,
            })
            .await
            .unwrap()
    }

    use crate::store::SyncMode;

    #[tokio::test]
    async fn test_create_book_dedups_by_owner_and_hash() {
        let store = MemoryStore::new();
        let first = store.create_book(new_book("u1", "same text")).await.unwrap();
        let second = store.create_book(new_book("u1", "same text")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_books("u1").await.unwrap().len(), 1);

        // A different owner gets a separate record.
        let other = store.create_book(new_book("u2", "same text")).await.unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let store = MemoryStore::new();
        let book = store.create_book(new_book("u1", "text")).await.unwrap();

        assert!(matches!(
            store.get_book("intruder", &book.id).await,
            Err(SyncError::Unauthorized(_))
        ));
        assert!(matches!(
            store.get_book("u1", "book_999").await,
            Err(SyncError::NotFound { .. })
        ));
        assert!(store.get_book("u1", &book.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_audiobook_requires_positive_duration() {
        let store = MemoryStore::new();
        let mut bad = new_audiobook("u1", "h");
        bad.duration_sec = 0.0;
        assert!(matches!(
            store.create_audiobook(bad).await,
            Err(SyncError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_create_session_returns_existing_pair() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        let again = store
            .create_session(NewSession {
                owner: "u1".to_string(),
                book_id: session.book_id.clone(),
                audio_id: session.audio_id.clone(),
                sync_mode: SyncMode::Progressive,
                word_chunk_size: None,
            })
            .await
            .unwrap();
        assert_eq!(session.id, again.id);
        assert_eq!(store.list_sessions("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_defaults() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.word_chunk_size, 1000);
        assert_eq!(session.progress, 0);
        assert_eq!(session.synced_up_to_word, 0);
        assert!(session.sync_anchors.is_empty());
    }

    #[tokio::test]
    async fn test_update_session_monotone_fields() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;

        let updated = store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    synced_up_to_word: Some(500),
                    progress_version: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.synced_up_to_word, 500);
        assert_eq!(updated.progress_version, 3);

        // Attempts to move backwards are ignored.
        let updated = store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    synced_up_to_word: Some(100),
                    progress_version: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.synced_up_to_word, 500);
        assert_eq!(updated.progress_version, 3);
    }

    #[tokio::test]
    async fn test_update_session_stamps_updated_at_and_playback() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        assert!(session.playback_updated_at.is_none());

        let updated = store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    playback_position_sec: Some(12.5),
                    playback_progress: Some(3.2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.playback_position_sec, 12.5);
        assert!(updated.playback_updated_at.is_some());
        assert!(updated.updated_at >= session.updated_at);
    }

    #[tokio::test]
    async fn test_delete_book_cascades_to_sessions() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        store.delete_book("u1", &session.book_id).await.unwrap();
        assert!(matches!(
            store.get_session("u1", &session.id).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_audiobook_cascades_to_sessions() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        store
            .delete_audiobook("u1", &session.audio_id)
            .await
            .unwrap();
        assert!(store.get_session("u1", &session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_find_session_by_pair() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;
        let found = store
            .find_session_by_pair("u1", &session.book_id, &session.audio_id)
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, session.id);

        let missing = store
            .find_session_by_pair("u1", &session.book_id, "audio_999")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_error_field_set_and_cleared() {
        let store = MemoryStore::new();
        let session = seeded_session(&store, "u1").await;

        let updated = store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    error: Some(Some("provider exploded".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.error.as_deref(), Some("provider exploded"));

        let cleared = store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.error.is_none());
    }
}
