//! Audio metadata probing via ffprobe.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::Result;

/// Probed source metadata. Duration stays `None` when ffprobe cannot
/// determine it; callers fall back to blind segmentation.
#[derive(Debug, Clone, Copy)]
pub struct AudioInfo {
    pub duration_sec: Option<f64>,
    pub byte_size: u64,
}

impl AudioInfo {
    /// Average encoded byte rate, when the duration is known.
    pub fn bytes_per_second(&self) -> Option<f64> {
        match self.duration_sec {
            Some(d) if d > 0.0 => Some(self.byte_size as f64 / d),
            _ => None,
        }
    }
}

/// Duration of an audio file in seconds, or `None` when ffprobe fails or
/// reports nothing usable.
pub async fn probe_duration(path: &Path) -> Option<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            log::warn!("ffprobe failed to run: {}", e);
            return None;
        }
    };
    if !output.status.success() {
        log::warn!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    let duration = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok()?;
    (duration > 0.0).then_some(duration)
}

/// Probe duration and byte size of a source file.
pub async fn probe(path: &Path) -> Result<AudioInfo> {
    let byte_size = tokio::fs::metadata(path).await?.len();
    let duration_sec = probe_duration(path).await;
    Ok(AudioInfo {
        duration_sec,
        byte_size,
    })
}
