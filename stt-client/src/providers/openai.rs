//! OpenAI-compatible transcription provider.
//!
//! Uses the audio transcriptions API (`/v1/audio/transcriptions`) with
//! `verbose_json` output so every response carries per-segment timestamps.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;

use crate::error::{Result, SttError};
use crate::provider::{SttProvider, Transcription, TranscriptSegment};

/// Uploads below this size are rejected as too short to contain speech.
const MIN_UPLOAD_BYTES: u64 = 1024;

/// Default provider upload limit: 25 MiB.
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Provider for OpenAI-compatible transcription APIs.
pub struct OpenAiProvider {
    model: String,
    base_url: String,
    api_key: String,
    max_upload_bytes: u64,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider against the default OpenAI endpoint.
    pub fn new(api_key: String) -> Self {
        Self {
            model: "whisper-1".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout: Duration::from_secs(300),
            client: reqwest::Client::new(),
        }
    }

    /// Override the model name.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Override the base URL (for self-hosted compatible servers).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Override the advertised upload limit.
    pub fn with_max_upload_bytes(mut self, limit: u64) -> Self {
        self.max_upload_bytes = limit;
        self
    }
}

/// Map a container extension to one the transcription API accepts.
fn format_to_extension(format: &str) -> &str {
    match format.to_lowercase().as_str() {
        "wav" => "wav",
        "mp3" | "mpeg" => "mp3",
        "mp4" | "m4a" => "m4a",
        "ogg" | "oga" => "ogg",
        "flac" => "flac",
        "webm" => "webm",
        _ => "mp3",
    }
}

// Wire types for the verbose_json response.

#[derive(Debug, Deserialize)]
struct VerboseResponse {
    text: String,
    duration: Option<f64>,
    segments: Option<Vec<ApiSegment>>,
}

#[derive(Debug, Deserialize)]
struct ApiSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[async_trait]
impl SttProvider for OpenAiProvider {
    async fn transcribe(&self, path: &Path, format: &str) -> Result<Transcription> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        if size < MIN_UPLOAD_BYTES {
            return Err(SttError::AudioTooShort(size));
        }
        if size > self.max_upload_bytes {
            return Err(SttError::UploadTooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let ext = format_to_extension(format);
        let file_part = multipart::Part::bytes(bytes)
            .file_name(format!("audio.{}", ext))
            .mime_str(&format!("audio/{}", ext))
            .map_err(|e| SttError::Api {
                message: format!("MIME error: {}", e),
                status_code: None,
            })?;

        let form = multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json".to_string());

        let url = format!("{}/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| SttError::Api {
                message: format!("request failed: {}", e),
                status_code: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => parsed.error.message,
                Err(_) => body,
            };
            return Err(SttError::Api {
                message,
                status_code: Some(status.as_u16()),
            });
        }

        let body = response.text().await.map_err(|e| SttError::Api {
            message: format!("failed to read response: {}", e),
            status_code: None,
        })?;
        let parsed: VerboseResponse = serde_json::from_str(&body)
            .map_err(|e| SttError::MalformedResponse(e.to_string()))?;

        let segments: Vec<TranscriptSegment> = parsed
            .segments
            .unwrap_or_default()
            .into_iter()
            .map(|s| TranscriptSegment::new(s.start, s.end, s.text.trim()))
            .collect();

        Ok(Transcription {
            text: parsed.text.trim().to_string(),
            duration: parsed.duration,
            segments,
        })
    }

    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    fn is_available(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(SttError::MissingApiKey {
                provider: "OpenAI".to_string(),
                env_var: "OPENAI_API_KEY".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_to_extension() {
        assert_eq!(format_to_extension("MP3"), "mp3");
        assert_eq!(format_to_extension("m4a"), "m4a");
        assert_eq!(format_to_extension("wav"), "wav");
        assert_eq!(format_to_extension("unknown"), "mp3");
    }

    #[test]
    fn test_verbose_response_parsing() {
        let body = r#"{
            "text": "Hello world.",
            "duration": 4.2,
            "segments": [
                {"id": 0, "start": 0.0, "end": 2.0, "text": " Hello"},
                {"id": 1, "start": 2.0, "end": 4.2, "text": " world."}
            ]
        }"#;
        let parsed: VerboseResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.text, "Hello world.");
        assert_eq!(parsed.duration, Some(4.2));
        assert_eq!(parsed.segments.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_verbose_response_without_segments() {
        let body = r#"{"text": "Hello."}"#;
        let parsed: VerboseResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.segments.is_none());
        assert!(parsed.duration.is_none());
    }

    #[test]
    fn test_is_available_requires_key() {
        let provider = OpenAiProvider::new(String::new());
        assert!(provider.is_available().is_err());

        let provider = OpenAiProvider::new("sk-test".to_string());
        assert!(provider.is_available().is_ok());
    }
}
