//! # Transcription Engine
//!
//! Runs a leased speech model over one normalized WAV file and returns the
//! ordered transcript segments.
//!
//! ## Key Responsibilities:
//! - **Input validation**: the file must be mono, 16kHz, 16-bit PCM
//! - **Off-thread inference**: the model runs on a blocking thread so the
//!   async runtime keeps serving submissions
//! - **One inference at a time**: a thread abandoned by a timed-out job keeps
//!   the inference slot until it returns, so the next job waits for it
//! - **Fixed decoding settings**: beam width and language come from config

use crate::audio::TARGET_SAMPLE_RATE;
use crate::error::JobError;
use crate::transcription::lifecycle::ModelLease;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A piece of recognized text with its position in the audio, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl TranscriptSegment {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }
}

/// Decoding settings handed to the model for every job.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    /// ISO 639-1 code (e.g. "ru")
    pub language: String,
    pub beam_size: usize,
    /// Upper bound on generated tokens per 30 second window
    pub max_tokens: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            language: "ru".to_string(),
            beam_size: 5,
            max_tokens: 224,
        }
    }
}

/// A loaded acoustic model.
///
/// Implementations take 16kHz mono samples in `[-1.0, 1.0]` and return
/// segments in the order they occur. Calls may block for a long time; the
/// engine always invokes them from a blocking thread.
pub trait SpeechModel: Send + Sync {
    fn transcribe(&self, pcm: &[f32], opts: &DecodeOptions) -> anyhow::Result<Vec<TranscriptSegment>>;
}

pub struct TranscriptionEngine {
    options: DecodeOptions,
    /// Held by the inference thread itself, not by the awaiting future.
    inference_slot: Arc<Mutex<()>>,
}

impl TranscriptionEngine {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            inference_slot: Arc::new(Mutex::new(())),
        }
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Transcribe `wav_path` with the model held by `lease`.
    ///
    /// The inference thread holds its own share of the lease and the inference
    /// slot. If this future is dropped midway the model cannot be evicted
    /// under the thread, and no other inference starts before it returns.
    pub async fn transcribe(
        &self,
        lease: &ModelLease,
        wav_path: &Path,
    ) -> Result<Vec<TranscriptSegment>, JobError> {
        let path = wav_path.to_path_buf();
        let pcm = tokio::task::spawn_blocking(move || read_canonical_wav(&path))
            .await
            .map_err(|e| JobError::Decode(format!("WAV reader task failed: {}", e)))??;

        let audio_secs = pcm.len() as f64 / TARGET_SAMPLE_RATE as f64;
        debug!(audio_secs, beam_size = self.options.beam_size, "Starting inference");

        let slot = self.inference_slot.clone().lock_owned().await;
        let started = Instant::now();
        let inflight = lease.clone();
        let options = self.options.clone();
        let segments = tokio::task::spawn_blocking(move || {
            let result = inflight.model().transcribe(&pcm, &options);
            drop(inflight);
            drop(slot);
            result
        })
        .await
        .map_err(|e| JobError::Transcription(format!("inference task failed: {}", e)))?
        .map_err(|e| JobError::Transcription(format!("{:#}", e)))?;

        info!(
            audio_secs,
            inference_secs = started.elapsed().as_secs_f64(),
            segments = segments.len(),
            "Transcription finished"
        );
        Ok(segments)
    }
}

/// Concatenate segment texts with single spaces.
pub fn join_segments(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read a mono 16kHz 16-bit WAV into f32 samples.
fn read_canonical_wav(path: &Path) -> Result<Vec<f32>, JobError> {
    let reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
            JobError::FileNotFound(path.to_path_buf())
        }
        other => JobError::Decode(format!("cannot read {}: {}", path.display(), other)),
    })?;

    let spec = reader.spec();
    if spec.channels != 1
        || spec.sample_rate != TARGET_SAMPLE_RATE
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(JobError::Decode(format!(
            "expected mono 16kHz 16-bit PCM, got {} ch / {} Hz / {}-bit {:?}",
            spec.channels, spec.sample_rate, spec.bits_per_sample, spec.sample_format
        )));
    }

    reader
        .into_samples::<i16>()
        .map(|sample| sample.map(|s| s as f32 / 32768.0))
        .collect::<Result<Vec<f32>, _>>()
        .map_err(|e| JobError::Decode(format!("corrupt WAV data: {}", e)))
}
