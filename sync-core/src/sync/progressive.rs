//! Progressive sync: initial alignment probe, on-demand word chunks, and
//! reader-driven auto-advance.
//!
//! A progressive session syncs one word window at a time, staying just
//! ahead of the reader instead of transcribing the whole book up front.
//! The probe absorbs narrator intros and front matter that have no
//! counterpart in the text.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::align::fuzzy::WindowIndex;
use crate::align::{Anchor, Fragment, align_fragments, merge_anchors, position_at};
use crate::blob::temp_chunk_prefix;
use crate::error::{Result, SyncError};
use crate::store::{SessionPatch, SessionStatus, SyncMode, SyncSession, SyncStep};
use crate::sync::SyncOrchestrator;
use crate::sync::words::WordMap;

impl SyncOrchestrator {
    /// Entry point for `start_sync` in progressive mode: run the initial
    /// alignment probe, seed the anchor set, and sync the first (small)
    /// word chunk so the reader can start within seconds.
    pub(crate) async fn run_progressive_start(
        &self,
        owner: &str,
        session: &SyncSession,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = &session.id;
        self.step(owner, id, SyncStep::Extracting, 10).await?;
        let book = self.store().get_book(owner, &session.book_id).await?;
        let audio = self.store().get_audiobook(owner, &session.audio_id).await?;

        let map = WordMap::new(&book.plain_text);
        if map.is_empty() {
            // A cover-only book has nothing to sync; complete with zero
            // anchors rather than probing silence against empty text.
            log::warn!("session {}: book has no text, completing empty", id);
            self.store()
                .update_session(
                    owner,
                    id,
                    SessionPatch {
                        status: Some(SessionStatus::Complete),
                        current_step: Some(SyncStep::Complete),
                        progress: Some(100),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        self.step(owner, id, SyncStep::Segmenting, 20).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let source = self.stage_source(id, &audio).await?;

        self.step(owner, id, SyncStep::Transcribing, 30).await?;
        let probe = self
            .initial_probe(id, &book.plain_text, &map, &source, audio.format, cancel)
            .await?;
        self.store()
            .update_session(
                owner,
                id,
                SessionPatch {
                    sync_anchors: Some(vec![probe]),
                    ..Default::default()
                },
            )
            .await?;

        let start_word = map.word_at_char(probe.char_index);
        let first_words = self.config().progressive_first_chunk_words;
        self.sync_word_chunk(owner, id, start_word, first_words, Some(probe.audio_time))
            .await?;
        Ok(())
    }

    /// Transcribe the opening seconds of audio and match each segment
    /// independently against a wide book prefix. The best match above the
    /// confidence floor becomes the seed anchor; with no acceptable match
    /// the session anchors at the origin.
    async fn initial_probe(
        &self,
        session_id: &str,
        text: &str,
        map: &WordMap,
        source: &std::path::Path,
        format: crate::audio::AudioFormat,
        cancel: &CancellationToken,
    ) -> Result<Anchor> {
        let probe_chunk = self
            .segmenter()
            .extract_range(
                session_id,
                source,
                format,
                0.0,
                self.config().initial_alignment_probe_sec,
                "probe",
            )
            .await?;
        let result = self
            .transcribe_chunk(session_id, &probe_chunk, cancel, false)
            .await;
        if probe_chunk.owned {
            let _ = tokio::fs::remove_file(&probe_chunk.path).await;
        }
        let transcription = result?;

        let prefix_end = map
            .char_range(0, self.config().initial_alignment_search_words)
            .map(|(_, end)| end)
            .unwrap_or(0);
        let index = WindowIndex::new(&text[..prefix_end]);

        let mut best: Option<Anchor> = None;
        for segment in &transcription.segments {
            let Some(found) = index.best_match(&segment.text) else {
                continue;
            };
            if found.confidence <= self.config().anchor_confidence_floor {
                continue;
            }
            if best.map_or(true, |b| found.confidence > b.confidence) {
                best = Some(Anchor::new(segment.start, found.char_index, found.confidence));
            }
        }

        Ok(best.unwrap_or_else(|| {
            log::warn!(
                "session {}: initial alignment probe found no match, anchoring at the origin",
                session_id
            );
            Anchor::new(0.0, 0, 0.5)
        }))
    }

    /// Sync one word window: extract the matching audio, transcribe it,
    /// align against the (overlap-padded) text slice, and merge the new
    /// anchors into the session.
    ///
    /// Returns `false` without mutating anything when the session is
    /// paused or the clamped word range is empty. Pipeline failures are
    /// persisted as session errors and returned as `Err`.
    pub async fn sync_word_chunk(
        &self,
        owner: &str,
        session_id: &str,
        word_start: usize,
        word_count: usize,
        known_audio_start: Option<f64>,
    ) -> Result<bool> {
        let handle = self.handle(session_id);
        let cancel = handle.cancel.clone();

        let before = self.store().get_session(owner, session_id).await?;
        if before.status == SessionStatus::Paused {
            log::debug!("session {} is paused; refusing word chunk", session_id);
            return Ok(false);
        }

        let result = self
            .word_chunk_impl(
                owner,
                &before,
                word_start,
                word_count,
                known_audio_start,
                &cancel,
            )
            .await;

        match result {
            Ok(advanced) => {
                if advanced {
                    let after = self.store().get_session(owner, session_id).await?;
                    // The advance latch opens only when the frontier
                    // actually moved.
                    if after.synced_up_to_word > before.synced_up_to_word {
                        handle.advance_in_flight.store(false, Ordering::SeqCst);
                    }
                }
                Ok(advanced)
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                let _ = self
                    .store()
                    .update_session(
                        owner,
                        session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Error),
                            error: Some(Some(e.to_string())),
                            ..Default::default()
                        },
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn word_chunk_impl(
        &self,
        owner: &str,
        session: &SyncSession,
        word_start: usize,
        word_count: usize,
        known_audio_start: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let book = self.store().get_book(owner, &session.book_id).await?;
        let audio = self.store().get_audiobook(owner, &session.audio_id).await?;
        let map = WordMap::new(&book.plain_text);
        let total_words = map.word_count();

        if word_start >= total_words || word_count == 0 {
            return Ok(false);
        }
        let end_word = (word_start + word_count).min(total_words);

        let overlap = self.config().progressive_overlap_words;
        let Some((slice_start, slice_end)) =
            map.char_range_with_overlap(word_start, end_word - word_start, overlap)
        else {
            return Ok(false);
        };
        let slice = &book.plain_text[slice_start..slice_end];

        // Audio range: trust a known start when the caller has one,
        // otherwise estimate both ends from the narration rate.
        let audio_start = known_audio_start
            .unwrap_or_else(|| self.config().seconds_for_words(word_start))
            .clamp(0.0, audio.duration_sec);
        let duration = self
            .config()
            .seconds_for_words(end_word - word_start)
            .min(audio.duration_sec - audio_start);
        if duration <= 0.0 {
            return Ok(false);
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let source = self.stage_source(&session.id, &audio).await?;
        let chunk = self
            .segmenter()
            .extract_range(
                &session.id,
                &source,
                audio.format,
                audio_start,
                duration,
                &format!("words_{}", word_start),
            )
            .await?;

        let outcome = self
            .align_word_chunk(
                owner,
                session,
                slice,
                slice_start,
                end_word,
                total_words,
                &chunk,
                cancel,
            )
            .await;
        // The chunk is released on success and failure alike.
        if chunk.owned {
            let _ = tokio::fs::remove_file(&chunk.path).await;
        }
        outcome?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn align_word_chunk(
        &self,
        owner: &str,
        session: &SyncSession,
        slice: &str,
        slice_start: usize,
        end_word: usize,
        total_words: usize,
        chunk: &crate::audio::AudioChunk,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let transcription = self
            .transcribe_chunk(&session.id, chunk, cancel, false)
            .await?;

        let fragments: Vec<Fragment> = transcription
            .segments
            .iter()
            .map(|s| Fragment::new(chunk.start_time + s.start, s.text.clone()))
            .collect();

        let mut raw = align_fragments(slice, &fragments, self.config());
        // Back to global text coordinates.
        for anchor in &mut raw {
            anchor.char_index += slice_start;
        }
        if raw.is_empty() {
            log::warn!(
                "session {}: word chunk ending at {} produced no anchors",
                session.id,
                end_word
            );
        }
        let merged = merge_anchors(&session.sync_anchors, &raw, self.config());

        let new_frontier = session.synced_up_to_word.max(end_word);
        let complete = new_frontier >= total_words;
        let progress = (100 * new_frontier / total_words.max(1)).min(100) as u8;

        self.store()
            .update_session(
                owner,
                &session.id,
                SessionPatch {
                    sync_anchors: Some(merged),
                    synced_up_to_word: Some(end_word),
                    progress: Some(progress),
                    status: complete.then_some(SessionStatus::Complete),
                    current_step: complete.then_some(SyncStep::Complete),
                    ..Default::default()
                },
            )
            .await?;

        if complete {
            // The whole book is synced: nothing will need the staged
            // source or temp chunks again.
            if let Err(e) = self.segmenter().cleanup(&session.id, &[]).await {
                log::warn!("cleanup after completion failed: {}", e);
            }
            self.remove_staged_source(&session.id).await;
            let _ = self
                .blob()
                .delete_prefix(&temp_chunk_prefix(&session.id))
                .await;
        }
        Ok(())
    }

    /// Reader position report driving the chunk scheduler: when the
    /// reader is within the advance threshold of the synced frontier,
    /// schedule the next word chunk. At most one advance runs per session
    /// at a time.
    pub async fn auto_advance(
        &self,
        owner: &str,
        session_id: &str,
        position_sec: f64,
    ) -> Result<bool> {
        let session = self.store().get_session(owner, session_id).await?;
        if session.sync_mode != SyncMode::Progressive
            || session.status != SessionStatus::Processing
        {
            return Ok(false);
        }

        let book = self.store().get_book(owner, &session.book_id).await?;
        let map = WordMap::new(&book.plain_text);
        let total_words = map.word_count();
        if session.synced_up_to_word >= total_words {
            return Ok(false);
        }

        let current_char = position_at(&session.sync_anchors, position_sec);
        let current_word = map.word_at_char(current_char);
        if current_word + self.config().advance_threshold_words < session.synced_up_to_word {
            return Ok(false);
        }

        let handle = self.handle(session_id);
        if handle
            .advance_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        self.sync_word_chunk(
            owner,
            session_id,
            session.synced_up_to_word,
            session.word_chunk_size,
            None,
        )
        .await
    }

    /// Resume a paused progressive session and schedule exactly one chunk
    /// from the persisted frontier.
    pub async fn resume(&self, owner: &str, session_id: &str) -> Result<SyncSession> {
        let session = self.store().get_session(owner, session_id).await?;
        if session.status != SessionStatus::Paused {
            return Err(SyncError::Invariant(format!(
                "resume requires a paused session, status is {:?}",
                session.status
            )));
        }
        self.store()
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .await?;
        let handle = self.handle(session_id);
        handle.advance_in_flight.store(false, Ordering::SeqCst);

        match self
            .sync_word_chunk(
                owner,
                session_id,
                session.synced_up_to_word,
                session.word_chunk_size,
                None,
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_cancellation() => return Err(e),
            // Already persisted on the session row.
            Err(e) => log::warn!("chunk after resume failed: {}", e),
        }
        self.store().get_session(owner, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::sync::testutil::{fixture, sample_text, seed_pair, words_of};
    use stt_client::{MockProvider, SttError, scripted_transcription};

    const OPENING: &str =
        "Chapter One. The old library stood at the end of Maple Street and waited patiently.";

    async fn progressive_session(
        f: &crate::sync::testutil::Fixture,
        text: &str,
        duration: f64,
    ) -> SyncSession {
        let (book_id, audio_id) = seed_pair(f, "u1", text, duration).await;
        f.orchestrator
            .create_session("u1", &book_id, &audio_id, SyncMode::Progressive, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_progressive_start_absorbs_intro() {
        let text = sample_text(300, Some(OPENING));
        let stt = MockProvider::with_script(vec![
            // Probe: publisher intro (absent from the text), then the
            // opening sentence 32 s in.
            Ok(scripted_transcription(&[
                (
                    0.0,
                    12.0,
                    "welcome to this audio production presenting an unabridged recording",
                ),
                (
                    32.0,
                    41.0,
                    "chapter one the old library stood at the end of maple street",
                ),
            ])),
            // First word chunk.
            Ok(scripted_transcription(&[(
                2.0,
                14.0,
                &words_of(&text, 0, 20),
            )])),
        ]);
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 3600.0).await;

        let started = f.orchestrator.start_sync("u1", &session.id).await.unwrap();
        assert_eq!(started.status, SessionStatus::Processing);
        assert!(started.synced_up_to_word >= 75);

        // The probe anchor sits at the intro boundary, near the start of
        // the text.
        let probe = started
            .sync_anchors
            .iter()
            .find(|a| (a.audio_time - 32.0).abs() < 1e-9)
            .expect("probe anchor");
        assert!(probe.char_index < 200);

        // Probe extraction then the first word chunk at the known start.
        let extracts = f.segmenter.extract_log();
        assert_eq!(extracts.len(), 2);
        assert_eq!(extracts[0], (0.0, 45.0, "probe".to_string()));
        assert_eq!(extracts[1].0, 32.0);
        assert_eq!(extracts[1].2, "words_0");
        // 75 words at 150 wpm is 30 s of audio.
        assert!((extracts[1].1 - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_fallback_anchors_at_origin() {
        let text = sample_text(300, Some(OPENING));
        let stt = MockProvider::with_script(vec![
            Ok(scripted_transcription(&[(
                5.0,
                15.0,
                "totally unrelated nonsense that matches nothing in the book",
            )])),
            Ok(scripted_transcription(&[(
                1.0,
                10.0,
                &words_of(&text, 0, 20),
            )])),
        ]);
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 3600.0).await;

        let started = f.orchestrator.start_sync("u1", &session.id).await.unwrap();
        let first = started.sync_anchors.first().unwrap();
        assert_eq!(first.audio_time, 0.0);
        assert_eq!(first.char_index, 0);

        // First chunk started from the fallback anchor's time.
        let extracts = f.segmenter.extract_log();
        assert_eq!(extracts[1].0, 0.0);
    }

    #[tokio::test]
    async fn test_empty_book_completes_with_zero_anchors() {
        let stt = MockProvider::always(scripted_transcription(&[(0.0, 5.0, "anything here")]));
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, "", 3600.0).await;

        let done = f.orchestrator.start_sync("u1", &session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
        assert_eq!(done.progress, 100);
        assert!(done.sync_anchors.is_empty());
        assert_eq!(f.stt.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_word_chunk_out_of_range_refuses() {
        let text = sample_text(300, None);
        let stt = MockProvider::always(scripted_transcription(&[(0.0, 5.0, "anything here")]));
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 3600.0).await;
        f.store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let advanced = f
            .orchestrator
            .sync_word_chunk("u1", &session.id, 5000, 1000, None)
            .await
            .unwrap();
        assert!(!advanced);
        assert_eq!(f.stt.call_count(), 0);
        assert!(f.segmenter.extract_log().is_empty());

        let unchanged = f.store.get_session("u1", &session.id).await.unwrap();
        assert_eq!(unchanged.synced_up_to_word, 0);
    }

    #[tokio::test]
    async fn test_pause_refuses_chunks_and_resume_schedules_one() {
        let text = sample_text(8000, None);
        let stt = MockProvider::with_script(vec![Ok(scripted_transcription(&[(
            3.0,
            12.0,
            &words_of(&text, 5000, 5015),
        )]))]);
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 36_000.0).await;

        // Five chunks already committed.
        f.store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    synced_up_to_word: Some(5000),
                    sync_anchors: Some(vec![
                        crate::align::Anchor::new(0.0, 0, 1.0),
                        crate::align::Anchor::new(2000.0, 30_000, 0.9),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let paused = f.orchestrator.pause("u1", &session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        // Pausing again is a no-op.
        let again = f.orchestrator.pause("u1", &session.id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Paused);

        // Advance requests are refused while paused.
        assert!(
            !f.orchestrator
                .auto_advance("u1", &session.id, 2000.0)
                .await
                .unwrap()
        );
        assert!(
            !f.orchestrator
                .sync_word_chunk("u1", &session.id, 5000, 1000, None)
                .await
                .unwrap()
        );
        assert!(f.segmenter.extract_log().is_empty());

        // Resume schedules exactly one chunk from the frontier.
        let resumed = f.orchestrator.resume("u1", &session.id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Processing);
        assert_eq!(resumed.synced_up_to_word, 6000);
        let extracts = f.segmenter.extract_log();
        assert_eq!(extracts.len(), 1);
        assert_eq!(extracts[0].2, "words_5000");
        // Estimated from the narration rate: word 5000 at 150 wpm.
        assert!((extracts[0].0 - 2000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_auto_advance_threshold_and_latch() {
        let text = sample_text(4000, None);
        let stt = MockProvider::with_script(vec![Ok(scripted_transcription(&[(
            5.0,
            15.0,
            &words_of(&text, 1000, 1015),
        )]))]);
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 1600.0).await;

        let end_char = text.len();
        f.store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    synced_up_to_word: Some(1000),
                    sync_anchors: Some(vec![
                        crate::align::Anchor::new(0.0, 0, 1.0),
                        crate::align::Anchor::new(1600.0, end_char, 1.0),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Reader far behind the frontier: no advance.
        assert!(
            !f.orchestrator
                .auto_advance("u1", &session.id, 10.0)
                .await
                .unwrap()
        );
        assert!(f.segmenter.extract_log().is_empty());

        // A latched advance blocks new ones.
        let handle = f.orchestrator.handle(&session.id);
        handle
            .advance_in_flight
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(
            !f.orchestrator
                .auto_advance("u1", &session.id, 400.0)
                .await
                .unwrap()
        );
        handle
            .advance_in_flight
            .store(false, std::sync::atomic::Ordering::SeqCst);

        // Reader near the frontier: the next chunk runs and the latch
        // reopens once the frontier grows.
        assert!(
            f.orchestrator
                .auto_advance("u1", &session.id, 400.0)
                .await
                .unwrap()
        );
        let session = f.store.get_session("u1", &session.id).await.unwrap();
        assert_eq!(session.synced_up_to_word, 2000);
        assert!(
            !handle
                .advance_in_flight
                .load(std::sync::atomic::Ordering::SeqCst)
        );
        assert_eq!(f.segmenter.extract_log().len(), 1);
        assert_eq!(f.segmenter.extract_log()[0].2, "words_1000");
    }

    #[tokio::test]
    async fn test_word_chunk_transcription_failure_errors_session() {
        let text = sample_text(2000, None);
        let stt = MockProvider::always_fails(SttError::Api {
            message: "bad gateway".to_string(),
            status_code: Some(502),
        });
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 3600.0).await;
        f.store
            .update_session(
                "u1",
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = f
            .orchestrator
            .sync_word_chunk("u1", &session.id, 0, 1000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transcription(_)));
        // No automatic retry in progressive mode.
        assert_eq!(f.stt.call_count(), 1);

        let errored = f.store.get_session("u1", &session.id).await.unwrap();
        assert_eq!(errored.status, SessionStatus::Error);
        assert!(errored.error.as_deref().unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_progressive_completes_and_cleans_up() {
        let text = sample_text(100, None);
        let stt = MockProvider::with_script(vec![
            Ok(scripted_transcription(&[(
                0.0,
                8.0,
                &words_of(&text, 0, 12),
            )])),
            Ok(scripted_transcription(&[(
                1.0,
                9.0,
                &words_of(&text, 40, 55),
            )])),
            Ok(scripted_transcription(&[(
                2.0,
                10.0,
                &words_of(&text, 80, 95),
            )])),
        ]);
        let f = fixture(Vec::new(), stt);
        let session = progressive_session(&f, &text, 300.0).await;

        f.orchestrator.start_sync("u1", &session.id).await.unwrap();
        let advanced = f
            .orchestrator
            .sync_word_chunk("u1", &session.id, 75, 1000, None)
            .await
            .unwrap();
        assert!(advanced);

        let done = f.store.get_session("u1", &session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
        assert_eq!(done.current_step, SyncStep::Complete);
        assert_eq!(done.progress, 100);
        assert_eq!(done.synced_up_to_word, 100);
        // Completion triggered teardown of the working state.
        assert!(f.segmenter.cleanup_count() >= 1);
    }
}
