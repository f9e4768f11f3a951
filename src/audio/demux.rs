//! Audio track extraction through an external `ffmpeg` binary.
//!
//! Used for video containers (`.mp4`, `.mov`, `.mkv`) and as the fallback
//! transcoder for audio codecs the in-process decoder cannot handle.

use crate::cleanup;
use crate::error::JobError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Longest stderr excerpt carried into an error.
const STDERR_EXCERPT_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct Demuxer {
    ffmpeg_path: String,
}

impl Demuxer {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Where [`Demuxer::extract_audio`] writes the audio track of `input`.
    pub fn output_path_for(input: &Path) -> PathBuf {
        input.with_extension("demux.wav")
    }

    /// Pull the audio track out of a video file into a mono 16 kHz WAV next to it.
    ///
    /// The video is deleted once extraction succeeds. On failure it is left
    /// in place for the caller's cleanup.
    pub async fn extract_audio(&self, input: &Path) -> Result<PathBuf, JobError> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(JobError::FileNotFound(input.to_path_buf()));
        }

        let output = Self::output_path_for(input);
        if let Err(detail) = self.convert_to_wav(input, &output).await {
            cleanup::remove_best_effort(&output).await;
            return Err(JobError::Demux(detail));
        }

        info!(input = %input.display(), output = %output.display(), "Audio track extracted");
        cleanup::remove_best_effort(input).await;
        Ok(output)
    }

    /// Run `ffmpeg -y -i <input> -vn -ac 1 -ar 16000 -c:a pcm_s16le <output>`.
    ///
    /// The child is killed if this future is dropped (job watchdog expiry).
    /// Errors carry a short stderr excerpt.
    pub async fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<(), String> {
        debug!(ffmpeg = %self.ffmpeg_path, input = %input.display(), "Running ffmpeg");

        let result = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.ffmpeg_path, e))?;

        if !result.status.success() {
            return Err(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr_excerpt(&result.stderr)
            ));
        }

        Ok(())
    }
}

/// Tail of ffmpeg's stderr, where the actual error usually is.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - STDERR_EXCERPT_CHARS).collect()
}
