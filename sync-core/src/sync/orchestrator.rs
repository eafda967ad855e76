//! The sync orchestrator: session state machine, full-book pipeline,
//! playback checkpointing, and lifecycle control.
//!
//! One orchestrator serves many sessions. Within a session the pipeline
//! steps run strictly in order; across sessions only the session row is
//! shared, and every write goes through the store's atomic
//! `update_session`. Temporary files are released on every exit path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::align::{Fragment, align_fragments, position_at, select_anchors};
use crate::audio::{AudioChunk, AudioSegmenter, ChunkOptions};
use crate::blob::{BlobStore, temp_chunk_prefix};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::{
    AudiobookRecord, NewSession, SessionPatch, SessionStatus, SessionStore, SyncMode, SyncSession,
    SyncStep,
};
use stt_client::{SttError, SttProvider, Transcription};

/// Per-session control state: cancellation plus the auto-advance latch.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) cancel: CancellationToken,
    pub(crate) advance_in_flight: Arc<AtomicBool>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            advance_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn SessionStore>,
    blob: Arc<dyn BlobStore>,
    segmenter: Arc<dyn AudioSegmenter>,
    stt: Arc<dyn SttProvider>,
    config: SyncConfig,
    work_root: PathBuf,
    handles: Mutex<HashMap<String, SessionHandle>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        blob: Arc<dyn BlobStore>,
        segmenter: Arc<dyn AudioSegmenter>,
        stt: Arc<dyn SttProvider>,
        config: SyncConfig,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            blob,
            segmenter,
            stt,
            config,
            work_root: work_root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub(crate) fn segmenter(&self) -> &Arc<dyn AudioSegmenter> {
        &self.segmenter
    }

    pub(crate) fn blob(&self) -> &Arc<dyn BlobStore> {
        &self.blob
    }

    pub(crate) fn handle(&self, session_id: &str) -> SessionHandle {
        self.handles
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert_with(SessionHandle::new)
            .clone()
    }

    fn drop_handle(&self, session_id: &str) {
        self.handles.lock().unwrap().remove(session_id);
    }

    /// Create a sync session pairing a book and an audiobook. Returns the
    /// existing live session when the pair is already being synced.
    pub async fn create_session(
        &self,
        owner: &str,
        book_id: &str,
        audio_id: &str,
        sync_mode: SyncMode,
        word_chunk_size: Option<usize>,
    ) -> Result<SyncSession> {
        self.store
            .create_session(NewSession {
                owner: owner.to_string(),
                book_id: book_id.to_string(),
                audio_id: audio_id.to_string(),
                sync_mode,
                word_chunk_size,
            })
            .await
    }

    /// Start a pending session. Full mode runs the whole pipeline to
    /// completion; progressive mode runs the initial alignment probe plus
    /// the first word chunk and then waits for advance requests.
    ///
    /// Pipeline failures are persisted on the session (`status = error`)
    /// and returned as the updated record, not as an `Err`.
    pub async fn start_sync(&self, owner: &str, session_id: &str) -> Result<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status != SessionStatus::Pending {
            return Err(SyncError::Invariant(format!(
                "cannot start session {} from status {:?}",
                session_id, session.status
            )));
        }
        let session = self
            .store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .await?;

        let cancel = self.handle(session_id).cancel.clone();
        let result = match session.sync_mode {
            SyncMode::Full => self.run_full(owner, &session, &cancel).await,
            SyncMode::Progressive => self.run_progressive_start(owner, &session, &cancel).await,
        };
        self.finish_pipeline(owner, session_id, result).await
    }

    /// Map a pipeline outcome onto the session row. Cancellation is
    /// silent; anything else becomes a persisted error message.
    pub(crate) async fn finish_pipeline(
        &self,
        owner: &str,
        session_id: &str,
        result: Result<()>,
    ) -> Result<SyncSession> {
        match result {
            Ok(()) => self.store.get_session(owner, session_id).await,
            Err(e) if e.is_cancellation() => {
                log::info!("session {} cancelled", session_id);
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                log::error!("session {} failed: {}", session_id, e);
                let patch = SessionPatch {
                    status: Some(SessionStatus::Error),
                    error: Some(Some(e.to_string())),
                    ..Default::default()
                };
                match self.store.update_session(owner, session_id, patch).await {
                    Ok(session) => Ok(session),
                    // Row gone (deleted mid-run): surface the original error.
                    Err(_) => Err(e),
                }
            }
        }
    }

    // ── Full-book pipeline ──────────────────────────────────────────

    async fn run_full(
        &self,
        owner: &str,
        session: &SyncSession,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut chunks: Vec<AudioChunk> = Vec::new();
        let outcome = self
            .full_pipeline(owner, session, cancel, &mut chunks)
            .await;

        // Temp files go on success, failure, and cancellation alike.
        if let Err(e) = self.segmenter.cleanup(&session.id, &chunks).await {
            log::warn!("chunk cleanup for session {} failed: {}", session.id, e);
        }
        self.remove_staged_source(&session.id).await;
        let _ = self.blob.delete_prefix(&temp_chunk_prefix(&session.id)).await;

        outcome
    }

    async fn full_pipeline(
        &self,
        owner: &str,
        session: &SyncSession,
        cancel: &CancellationToken,
        chunks: &mut Vec<AudioChunk>,
    ) -> Result<()> {
        let id = &session.id;
        self.step(owner, id, SyncStep::Extracting, 10).await?;
        let book = self.store.get_book(owner, &session.book_id).await?;
        let audio = self.store.get_audiobook(owner, &session.audio_id).await?;

        self.step(owner, id, SyncStep::Segmenting, 20).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let source = self.stage_source(id, &audio).await?;

        self.step(owner, id, SyncStep::Transcribing, 30).await?;
        *chunks = self
            .segmenter
            .chunk_file(
                id,
                &source,
                audio.format,
                ChunkOptions {
                    progressive: false,
                    use_blob_store: false,
                },
                cancel,
            )
            .await?;
        self.store
            .update_session(
                owner,
                id,
                SessionPatch {
                    total_chunks: Some(chunks.len()),
                    current_chunk: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        // Chunks run sequentially: provider rate limits dominate, so
        // concurrency buys nothing here.
        let mut fragments: Vec<Fragment> = Vec::new();
        let total_chunks = chunks.len().max(1);
        for (i, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let transcription = self.transcribe_chunk(id, chunk, cancel, true).await?;
            for segment in &transcription.segments {
                fragments.push(Fragment::new(
                    chunk.start_time + segment.start,
                    segment.text.clone(),
                ));
            }
            let progress = 35 + (35 * (i + 1) / total_chunks) as u8;
            self.store
                .update_session(
                    owner,
                    id,
                    SessionPatch {
                        current_chunk: Some(i + 1),
                        progress: Some(progress),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.step(owner, id, SyncStep::Matching, 75).await?;
        let raw = align_fragments(&book.plain_text, &fragments, &self.config);
        if raw.is_empty() {
            log::warn!(
                "session {}: no anchors above the confidence floor; emitting endpoints only",
                id
            );
        }
        let anchors = select_anchors(
            &raw,
            audio.duration_sec,
            book.plain_text.len(),
            &self.config,
        );

        let total_words = book.total_words();
        self.store
            .update_session(
                owner,
                id,
                SessionPatch {
                    sync_anchors: Some(anchors),
                    synced_up_to_word: Some(total_words),
                    status: Some(SessionStatus::Complete),
                    current_step: Some(SyncStep::Complete),
                    progress: Some(100),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn step(&self, owner: &str, id: &str, step: SyncStep, progress: u8) -> Result<()> {
        self.store
            .update_session(
                owner,
                id,
                SessionPatch {
                    current_step: Some(step),
                    progress: Some(progress),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    // ── Shared plumbing ─────────────────────────────────────────────

    /// Download the audiobook to the session's working area, reusing an
    /// earlier staged copy when present.
    pub(crate) async fn stage_source(
        &self,
        session_id: &str,
        audio: &AudiobookRecord,
    ) -> Result<PathBuf> {
        let dest = self.work_root.join(format!(
            "source_{}.{}",
            session_id,
            audio.format.extension()
        ));
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Ok(dest);
        }
        self.blob.get_to_file(&audio.blob_path, &dest).await?;
        Ok(dest)
    }

    pub(crate) async fn remove_staged_source(&self, session_id: &str) {
        let prefix = format!("source_{}.", session_id);
        let Ok(mut entries) = tokio::fs::read_dir(&self.work_root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&prefix)
            {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Transcribe one chunk, staging it back from the blob store when it
    /// was offloaded. An empty segment list counts as a provider failure.
    pub(crate) async fn transcribe_chunk(
        &self,
        session_id: &str,
        chunk: &AudioChunk,
        cancel: &CancellationToken,
        retry_once: bool,
    ) -> Result<Transcription> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let (path, staged) = match &chunk.blob_key {
            Some(key) => {
                let name = chunk
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "chunk.bin".to_string());
                let dest = self
                    .work_root
                    .join(format!("chunks_{}", session_id))
                    .join(name);
                self.blob.get_to_file(key, &dest).await?;
                (dest.clone(), Some(dest))
            }
            None => (chunk.path.clone(), None),
        };

        let format = chunk.format.extension();
        let mut result = self.stt.transcribe(&path, format).await;
        if retry_once && result.is_err() && !cancel.is_cancelled() {
            log::warn!(
                "transcription of chunk at {:.0}s failed, retrying once: {}",
                chunk.start_time,
                result.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
            );
            result = self.stt.transcribe(&path, format).await;
        }

        if let Some(staged) = staged {
            let _ = tokio::fs::remove_file(&staged).await;
        }

        let transcription = result?;
        if transcription.segments.is_empty() {
            return Err(SyncError::Transcription(SttError::MalformedResponse(
                "provider returned no segments".to_string(),
            )));
        }
        Ok(transcription)
    }

    // ── Lifecycle control ───────────────────────────────────────────

    /// Pause a progressive session. Pausing an already-paused session is
    /// a no-op returning the current record.
    pub async fn pause(&self, owner: &str, session_id: &str) -> Result<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status == SessionStatus::Paused {
            return Ok(session);
        }
        if session.sync_mode != SyncMode::Progressive {
            return Err(SyncError::Invariant(
                "pause is only valid for progressive sessions".to_string(),
            ));
        }
        if session.status != SessionStatus::Processing {
            return Err(SyncError::Invariant(format!(
                "cannot pause session in status {:?}",
                session.status
            )));
        }
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Paused),
                    ..Default::default()
                },
            )
            .await
    }

    /// Reset an errored session so it can be started again. Progress,
    /// step, and the error message are cleared; committed anchors and the
    /// synced frontier are left for the next run to extend.
    pub async fn retry(&self, owner: &str, session_id: &str) -> Result<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status != SessionStatus::Error {
            return Err(SyncError::Invariant(format!(
                "retry requires an errored session, status is {:?}",
                session.status
            )));
        }
        let handle = self.handle(session_id);
        handle
            .advance_in_flight
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Pending),
                    current_step: Some(SyncStep::Extracting),
                    progress: Some(0),
                    current_chunk: Some(0),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await
    }

    /// Delete a session: cancel in-flight work, drop the row, and purge
    /// temporary state everywhere.
    pub async fn delete_session(&self, owner: &str, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id);
        handle.cancel.cancel();

        self.store.delete_session(owner, session_id).await?;
        let _ = self
            .blob
            .delete_prefix(&temp_chunk_prefix(session_id))
            .await;
        let _ = self.segmenter.cleanup(session_id, &[]).await;
        self.remove_staged_source(session_id).await;
        self.drop_handle(session_id);
        Ok(())
    }

    // ── Playback checkpointing ──────────────────────────────────────

    /// Record a playback position report. Positions are validated against
    /// the audiobook duration; `progress_version` only ever moves forward.
    pub async fn report_playback(
        &self,
        owner: &str,
        session_id: &str,
        position_sec: f64,
        duration_sec: Option<f64>,
        progress_version: Option<u64>,
    ) -> Result<SyncSession> {
        if !position_sec.is_finite() || position_sec < 0.0 {
            return Err(SyncError::Invariant(format!(
                "invalid playback position {}",
                position_sec
            )));
        }
        let session = self.store.get_session(owner, session_id).await?;
        let duration = match duration_sec {
            Some(d) => d,
            None => {
                self.store
                    .get_audiobook(owner, &session.audio_id)
                    .await?
                    .duration_sec
            }
        };
        if position_sec > duration {
            return Err(SyncError::Invariant(format!(
                "playback position {:.1}s is beyond the {:.1}s duration",
                position_sec, duration
            )));
        }

        let playback_progress = if duration > 0.0 {
            100.0 * position_sec / duration
        } else {
            0.0
        };
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    playback_position_sec: Some(position_sec),
                    playback_progress: Some(playback_progress),
                    progress_version,
                    ..Default::default()
                },
            )
            .await
    }

    /// Text position for an audio time, interpolated over the session's
    /// sync curve.
    pub async fn reading_position(
        &self,
        owner: &str,
        session_id: &str,
        audio_time: f64,
    ) -> Result<usize> {
        let session = self.store.get_session(owner, session_id).await?;
        Ok(position_at(&session.sync_anchors, audio_time))
    }
}
