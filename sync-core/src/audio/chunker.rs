//! Audio segmentation with ffmpeg.
//!
//! Splits source audio into pieces the transcription provider will accept,
//! re-encoding containers it rejects. Every produced segment is verified
//! against the byte target, and every ffmpeg invocation runs under a
//! deadline so a wedged subprocess cannot stall a session.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::probe;
use super::{AudioChunk, AudioFormat, AudioSegmenter, ChunkOptions};
use crate::blob::{BlobStore, temp_chunk_key};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Cap on the first chunk of a progressive session, in seconds.
const FIRST_CHUNK_CAP_SEC: f64 = 120.0;
/// Segment length used when the source duration is unknown.
const FALLBACK_SEGMENT_SEC: f64 = 300.0;
/// An extracted segment below this size marks the end of the stream.
const MIN_SEGMENT_BYTES: u64 = 1024;
/// Safety cap on blind segmentation.
const MAX_FALLBACK_SEGMENTS: usize = 500;
/// Deadline for codec-copy extraction, in seconds.
const COPY_TIMEOUT_SEC: f64 = 120.0;

/// Plan fixed-duration segments covering `[0, total_duration)`.
///
/// Per-segment length is `chunk_target_bytes / bytes_per_second` clamped to
/// the configured bounds; with `cap_first` the opening segment is held to
/// 120 s so playback sync can begin within seconds.
pub fn plan_segments(
    total_duration: f64,
    bytes_per_second: f64,
    config: &SyncConfig,
    cap_first: bool,
) -> Vec<(f64, f64)> {
    let base = (config.chunk_target_bytes as f64 / bytes_per_second)
        .clamp(config.chunk_duration_min_sec, config.chunk_duration_max_sec);

    let mut segments = Vec::new();
    let mut start = 0.0;
    while start < total_duration {
        let planned = if segments.is_empty() && cap_first {
            base.min(FIRST_CHUNK_CAP_SEC)
        } else {
            base
        };
        let duration = planned.min(total_duration - start);
        segments.push((start, duration));
        start += planned;
    }
    segments
}

/// ffmpeg-backed segmenter. Working files live under
/// `<work_root>/chunks_<sessionId>` so concurrent sessions never collide.
pub struct FfmpegSegmenter {
    work_root: PathBuf,
    config: SyncConfig,
    blob: Option<Arc<dyn BlobStore>>,
}

impl FfmpegSegmenter {
    pub fn new(work_root: impl Into<PathBuf>, config: SyncConfig) -> Self {
        Self {
            work_root: work_root.into(),
            config,
            blob: None,
        }
    }

    /// Attach a blob store for chunk offloading.
    pub fn with_blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.work_root.join(format!("chunks_{}", session_id))
    }

    async fn extract_segment(
        &self,
        source: &Path,
        out: &Path,
        start_sec: f64,
        duration_sec: f64,
        reencode: bool,
    ) -> Result<()> {
        let timeout_sec = if reencode {
            (2.0 * duration_sec).max(60.0)
        } else {
            COPY_TIMEOUT_SEC
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .args(["-ss", &format!("{:.3}", start_sec)])
            .args(["-t", &format!("{:.3}", duration_sec)])
            .arg("-i")
            .arg(source);
        if reencode {
            // Drop cover-art / video tracks; audiobook rips often carry them.
            cmd.args(["-vn", "-c:a", "libmp3lame", "-b:a", "128k"]);
        } else {
            cmd.args(["-c", "copy"]);
        }
        cmd.arg(out).stdin(Stdio::null()).kill_on_drop(true);

        let run = tokio::time::timeout(Duration::from_secs_f64(timeout_sec), cmd.output()).await;
        let output = match run {
            Err(_) => {
                return Err(SyncError::AudioTool(format!(
                    "ffmpeg timed out after {:.0}s extracting {:.0}s at {:.0}s",
                    timeout_sec, duration_sec, start_sec
                )));
            }
            Ok(Err(e)) => {
                return Err(SyncError::AudioTool(format!("failed to run ffmpeg: {}", e)));
            }
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::AudioTool(format!(
                "ffmpeg failed: {}",
                stderr.lines().last().unwrap_or("unknown error").trim()
            )));
        }
        Ok(())
    }

    /// Check the size bound and build the chunk descriptor, offloading to
    /// the blob store when requested.
    async fn finish_segment(
        &self,
        session_id: &str,
        index: usize,
        path: PathBuf,
        start_time: f64,
        duration: f64,
        format: AudioFormat,
        use_blob_store: bool,
    ) -> Result<AudioChunk> {
        let byte_size = tokio::fs::metadata(&path).await?.len();
        if byte_size > self.config.chunk_target_bytes {
            return Err(SyncError::ChunkTooLarge {
                index,
                size: byte_size,
                limit: self.config.chunk_target_bytes,
            });
        }

        let mut chunk = AudioChunk {
            path,
            start_time,
            duration,
            byte_size,
            format,
            blob_key: None,
            owned: true,
        };

        if use_blob_store {
            if let Some(blob) = &self.blob {
                let key = temp_chunk_key(session_id, index, format.extension());
                let bytes = tokio::fs::read(&chunk.path).await?;
                blob.put(&key, &bytes).await?;
                tokio::fs::remove_file(&chunk.path).await?;
                chunk.blob_key = Some(key);
            }
        }
        Ok(chunk)
    }
}

#[async_trait]
impl AudioSegmenter for FfmpegSegmenter {
    async fn chunk_file(
        &self,
        session_id: &str,
        source: &Path,
        format: AudioFormat,
        options: ChunkOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<AudioChunk>> {
        let info = probe::probe(source).await?;

        // Small enough and directly acceptable: describe the original file.
        if format.provider_accepted() && info.byte_size <= self.config.provider_max_bytes {
            return Ok(vec![AudioChunk {
                path: source.to_path_buf(),
                start_time: 0.0,
                duration: info.duration_sec.unwrap_or(0.0),
                byte_size: info.byte_size,
                format,
                blob_key: None,
                owned: false,
            }]);
        }

        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let reencode = !format.provider_accepted();
        let out_format = if reencode { AudioFormat::Mp3 } else { format };
        let mut chunks: Vec<AudioChunk> = Vec::new();

        match (info.duration_sec, info.bytes_per_second()) {
            (Some(total), Some(bps)) => {
                let plan = plan_segments(total, bps, &self.config, options.progressive && reencode);
                log::info!(
                    "segmenting {:.0}s of {} into {} chunks for session {}",
                    total,
                    format,
                    plan.len(),
                    session_id
                );
                for (index, &(start, duration)) in plan.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    let out = dir.join(format!("chunk_{}.{}", index, out_format.extension()));
                    self.extract_segment(source, &out, start, duration, reencode)
                        .await?;
                    let chunk = self
                        .finish_segment(
                            session_id,
                            index,
                            out,
                            start,
                            duration,
                            out_format,
                            options.use_blob_store,
                        )
                        .await?;
                    chunks.push(chunk);
                }
            }
            _ => {
                // Duration unknown: extract fixed segments until the stream
                // runs dry.
                log::warn!(
                    "duration unknown for {}; falling back to blind segmentation",
                    source.display()
                );
                for index in 0..MAX_FALLBACK_SEGMENTS {
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    let start = index as f64 * FALLBACK_SEGMENT_SEC;
                    let out = dir.join(format!("chunk_{}.{}", index, out_format.extension()));
                    self.extract_segment(source, &out, start, FALLBACK_SEGMENT_SEC, reencode)
                        .await?;
                    let size = tokio::fs::metadata(&out).await.map(|m| m.len()).unwrap_or(0);
                    if size < MIN_SEGMENT_BYTES {
                        let _ = tokio::fs::remove_file(&out).await;
                        break;
                    }
                    let chunk = self
                        .finish_segment(
                            session_id,
                            index,
                            out,
                            start,
                            FALLBACK_SEGMENT_SEC,
                            out_format,
                            options.use_blob_store,
                        )
                        .await?;
                    chunks.push(chunk);
                }
            }
        }

        Ok(chunks)
    }

    async fn extract_range(
        &self,
        session_id: &str,
        source: &Path,
        format: AudioFormat,
        start_sec: f64,
        duration_sec: f64,
        label: &str,
    ) -> Result<AudioChunk> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let reencode = !format.provider_accepted();
        let out_format = if reencode { AudioFormat::Mp3 } else { format };
        let out = dir.join(format!("{}.{}", label, out_format.extension()));
        self.extract_segment(source, &out, start_sec, duration_sec, reencode)
            .await?;

        let byte_size = tokio::fs::metadata(&out).await?.len();
        if byte_size > self.config.chunk_target_bytes {
            return Err(SyncError::ChunkTooLarge {
                index: 0,
                size: byte_size,
                limit: self.config.chunk_target_bytes,
            });
        }
        Ok(AudioChunk {
            path: out,
            start_time: start_sec,
            duration: duration_sec,
            byte_size,
            format: out_format,
            blob_key: None,
            owned: true,
        })
    }

    async fn cleanup(&self, session_id: &str, chunks: &[AudioChunk]) -> Result<()> {
        for chunk in chunks {
            if let (Some(key), Some(blob)) = (&chunk.blob_key, &self.blob) {
                if let Err(e) = blob.delete(key).await {
                    log::warn!("failed to delete blob chunk {}: {}", key, e);
                }
            }
            if chunk.owned && chunk.path.exists() {
                if let Err(e) = tokio::fs::remove_file(&chunk.path).await {
                    log::warn!("failed to remove chunk {}: {}", chunk.path.display(), e);
                }
            }
        }

        let dir = self.session_dir(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
