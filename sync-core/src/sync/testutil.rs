//! Shared fixtures for orchestrator tests: a scripted segmenter, seeded
//! records, and synthetic book text whose words are globally unique so
//! fuzzy matches are exact and deterministic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioChunk, AudioFormat, AudioSegmenter, ChunkOptions};
use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::store::{MemoryStore, NewAudiobook, NewBook, SessionStore, sha256_hex};
use crate::sync::SyncOrchestrator;
use stt_client::MockProvider;

/// Segmenter that fabricates chunk descriptors without touching ffmpeg.
pub struct StubSegmenter {
    work_root: PathBuf,
    plan: Vec<(f64, f64)>,
    pub cleanups: AtomicUsize,
    pub extracts: Mutex<Vec<(f64, f64, String)>>,
}

impl StubSegmenter {
    pub fn new(work_root: impl Into<PathBuf>, plan: Vec<(f64, f64)>) -> Self {
        Self {
            work_root: work_root.into(),
            plan,
            cleanups: AtomicUsize::new(0),
            extracts: Mutex::new(Vec::new()),
        }
    }

    fn chunk(&self, index: usize, start: f64, duration: f64) -> AudioChunk {
        AudioChunk {
            path: self.work_root.join(format!("chunk_{}.mp3", index)),
            start_time: start,
            duration,
            byte_size: 1000,
            format: AudioFormat::Mp3,
            blob_key: None,
            owned: true,
        }
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn extract_log(&self) -> Vec<(f64, f64, String)> {
        self.extracts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSegmenter for StubSegmenter {
    async fn chunk_file(
        &self,
        _session_id: &str,
        _source: &Path,
        _format: AudioFormat,
        _options: ChunkOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<AudioChunk>> {
        if cancel.is_cancelled() {
            return Err(crate::error::SyncError::Cancelled);
        }
        Ok(self
            .plan
            .iter()
            .enumerate()
            .map(|(i, &(start, duration))| self.chunk(i, start, duration))
            .collect())
    }

    async fn extract_range(
        &self,
        _session_id: &str,
        _source: &Path,
        _format: AudioFormat,
        start_sec: f64,
        duration_sec: f64,
        label: &str,
    ) -> Result<AudioChunk> {
        self.extracts
            .lock()
            .unwrap()
            .push((start_sec, duration_sec, label.to_string()));
        Ok(AudioChunk {
            path: self.work_root.join(format!("{}.mp3", label)),
            start_time: start_sec,
            duration: duration_sec,
            byte_size: 500,
            format: AudioFormat::Mp3,
            blob_key: None,
            owned: true,
        })
    }

    async fn cleanup(&self, _session_id: &str, _chunks: &[AudioChunk]) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Book text of `words` unique words, a paragraph break every 20 words,
/// optionally led by a fixed opening sentence.
pub fn sample_text(words: usize, opening: Option<&str>) -> String {
    let mut out = String::new();
    let mut count = 0;
    if let Some(opening) = opening {
        out.push_str(opening);
        count += opening.split_whitespace().count();
    }
    while count < words {
        if !out.is_empty() {
            if count % 20 == 0 {
                out.push_str("\n\n");
            } else {
                out.push(' ');
            }
        }
        out.push_str(&format!("word{}", count));
        count += 1;
    }
    out
}

/// The words `[from, to)` of `text`, joined by single spaces. Used to
/// script transcripts that match the book exactly.
pub fn words_of(text: &str, from: usize, to: usize) -> String {
    text.split_whitespace()
        .skip(from)
        .take(to.saturating_sub(from))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Fixture {
    pub orchestrator: SyncOrchestrator,
    pub store: Arc<MemoryStore>,
    pub segmenter: Arc<StubSegmenter>,
    pub stt: Arc<MockProvider>,
    pub blob: Arc<LocalBlobStore>,
    pub _dir: tempfile::TempDir,
}

/// Wire an orchestrator from a chunk plan and a transcription script.
pub fn fixture(plan: Vec<(f64, f64)>, stt: MockProvider) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let blob = Arc::new(LocalBlobStore::new(dir.path().join("blob")));
    let segmenter = Arc::new(StubSegmenter::new(dir.path().join("work"), plan));
    let stt = Arc::new(stt);
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        blob.clone(),
        segmenter.clone(),
        stt.clone(),
        SyncConfig::default(),
        dir.path().join("work"),
    );
    Fixture {
        orchestrator,
        store,
        segmenter,
        stt,
        blob,
        _dir: dir,
    }
}

/// Seed a book and an audiobook for `owner`, staging the audio bytes in
/// the blob store so pipelines can download them.
pub async fn seed_pair(
    f: &Fixture,
    owner: &str,
    text: &str,
    duration_sec: f64,
) -> (String, String) {
    let book = f
        .store
        .create_book(NewBook {
            owner: owner.to_string(),
            title: "Fixture Book".to_string(),
            author: None,
            filename: "fixture.epub".to_string(),
            plain_text: text.to_string(),
            chapters: Vec::new(),
            annotated_chapters: None,
            blob_path: "books/fixture.epub".to_string(),
            content_hash: sha256_hex(text.as_bytes()),
            byte_size: text.len() as u64,
        })
        .await
        .unwrap();

    let audio_bytes = vec![1u8; 2048];
    f.blob.put("audio/fixture.mp3", &audio_bytes).await.unwrap();
    let audio = f
        .store
        .create_audiobook(NewAudiobook {
            owner: owner.to_string(),
            title: None,
            filename: "fixture.mp3".to_string(),
            duration_sec,
            format: AudioFormat::Mp3,
            blob_path: "audio/fixture.mp3".to_string(),
            content_hash: sha256_hex(&audio_bytes),
            byte_size: audio_bytes.len() as u64,
        })
        .await
        .unwrap();

    (book.id, audio.id)
}
