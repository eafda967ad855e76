//! Mock transcription provider for testing.
//!
//! Supports scripted per-call results so pipeline tests can simulate
//! chunk-by-chunk transcription, mid-run failures, and empty responses.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{Result, SttError};
use crate::provider::{SttProvider, Transcription, TranscriptSegment};

/// A mock provider that replays a script of transcription outcomes.
pub struct MockProvider {
    /// Outcomes consumed one per call, in order.
    script: Mutex<VecDeque<Result<Transcription>>>,
    /// Outcome repeated once the script is exhausted.
    fallback: Mutex<Option<Result<Transcription>>>,
    /// Paths passed to `transcribe`, for assertions.
    calls: Mutex<Vec<PathBuf>>,
    call_count: AtomicUsize,
    max_upload_bytes: u64,
}

impl MockProvider {
    /// Replay `outcomes` in order; error once the script runs out.
    pub fn with_script(outcomes: Vec<Result<Transcription>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }

    /// Return the same transcription on every call.
    pub fn always(transcription: Transcription) -> Self {
        let mock = Self::with_script(Vec::new());
        *mock.fallback.lock().unwrap() = Some(Ok(transcription));
        mock
    }

    /// Fail with the given error on every call.
    pub fn always_fails(error: SttError) -> Self {
        let mock = Self::with_script(Vec::new());
        *mock.fallback.lock().unwrap() = Some(Err(error));
        mock
    }

    /// Number of times `transcribe` was called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Paths passed to `transcribe`, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

/// Build a transcription from `(start, end, text)` tuples.
pub fn scripted_transcription(segments: &[(f64, f64, &str)]) -> Transcription {
    Transcription::from_segments(
        segments
            .iter()
            .map(|(start, end, text)| TranscriptSegment::new(*start, *end, *text))
            .collect(),
    )
}

/// Clone an SttError (needed because SttError doesn't implement Clone).
fn clone_error(err: &SttError) -> SttError {
    match err {
        SttError::MissingApiKey { provider, env_var } => SttError::MissingApiKey {
            provider: provider.clone(),
            env_var: env_var.clone(),
        },
        SttError::AudioTooShort(size) => SttError::AudioTooShort(*size),
        SttError::UploadTooLarge { size, limit } => SttError::UploadTooLarge {
            size: *size,
            limit: *limit,
        },
        SttError::Api {
            message,
            status_code,
        } => SttError::Api {
            message: message.clone(),
            status_code: *status_code,
        },
        SttError::MalformedResponse(s) => SttError::MalformedResponse(s.clone()),
        SttError::Io(_) => SttError::Api {
            message: "IO error (mock)".to_string(),
            status_code: None,
        },
    }
}

#[async_trait]
impl SttProvider for MockProvider {
    async fn transcribe(&self, path: &Path, _format: &str) -> Result<Transcription> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(path.to_path_buf());

        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }

        match self.fallback.lock().unwrap().as_ref() {
            Some(Ok(t)) => Ok(t.clone()),
            Some(Err(e)) => Err(clone_error(e)),
            None => Err(SttError::Api {
                message: "mock script exhausted".to_string(),
                status_code: None,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    fn is_available(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_replays_in_order() {
        let mock = MockProvider::with_script(vec![
            Ok(scripted_transcription(&[(0.0, 2.0, "one")])),
            Err(SttError::Api {
                message: "boom".to_string(),
                status_code: Some(500),
            }),
        ]);

        let first = mock.transcribe(Path::new("/tmp/a.mp3"), "mp3").await;
        assert_eq!(first.unwrap().text, "one");

        let second = mock.transcribe(Path::new("/tmp/b.mp3"), "mp3").await;
        assert!(second.is_err());

        // Script exhausted with no fallback
        let third = mock.transcribe(Path::new("/tmp/c.mp3"), "mp3").await;
        assert!(third.is_err());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_always_repeats() {
        let mock = MockProvider::always(scripted_transcription(&[(0.0, 1.0, "hi")]));
        for _ in 0..3 {
            let t = mock
                .transcribe(Path::new("/tmp/x.mp3"), "mp3")
                .await
                .unwrap();
            assert_eq!(t.text, "hi");
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_always_fails() {
        let mock = MockProvider::always_fails(SttError::Api {
            message: "overloaded".to_string(),
            status_code: Some(503),
        });
        for _ in 0..2 {
            assert!(mock.transcribe(Path::new("/tmp/x.mp3"), "mp3").await.is_err());
        }
    }
}
