//! # Audio Normalization
//!
//! Turns whatever the user uploaded into the one representation the speech
//! model accepts: a mono, 16 kHz, 16-bit PCM WAV file.
//!
//! ## Pipeline:
//! 1. **Decode**: symphonia, with the file extension as a format hint (the
//!    container is sniffed when there is none). Codecs symphonia does not
//!    implement, such as Opus voice notes, are transcoded by ffmpeg first.
//! 2. **Downmix and resample**: channel average, then rubato sinc resampling
//! 3. **Peak normalization**: loudest sample at -0.1 dBFS
//! 4. **Padding**: very short clips get trailing silence
//! 5. **Write**: hound, to a `.part` file renamed into place
//! 6. **Delete input**: only after the output is on disk

use crate::audio::demux::Demuxer;
use crate::audio::format::extension_of;
use crate::cleanup;
use crate::config::AudioConfig;
use crate::error::JobError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Peak level after normalization, in dBFS.
const PEAK_HEADROOM_DBFS: f32 = -0.1;

/// Peaks below this are treated as digital silence and left alone.
const SILENCE_FLOOR: f32 = 1e-6;

/// Why the in-process decoder gave up on a file.
#[derive(Debug)]
enum DecodeFailure {
    /// Container or codec symphonia does not implement; ffmpeg may still manage
    Unsupported(String),
    /// Anything else: truncated, corrupt or empty input
    Invalid(String),
}

impl DecodeFailure {
    fn message(&self) -> &str {
        match self {
            DecodeFailure::Unsupported(msg) | DecodeFailure::Invalid(msg) => msg,
        }
    }
}

fn classify(context: &str, err: SymphoniaError) -> DecodeFailure {
    match err {
        SymphoniaError::Unsupported(what) => {
            DecodeFailure::Unsupported(format!("{}: unsupported {}", context, what))
        }
        other => DecodeFailure::Invalid(format!("{}: {}", context, other)),
    }
}

/// Decides whether a finished `.part` file may still be renamed into place.
///
/// The writer runs on a blocking thread that outlives a dropped `normalize`
/// future. Cancelling and renaming both happen under this lock, so once
/// [`CommitGate::cancel`] returns the output either already exists or never
/// will.
#[derive(Debug, Default)]
struct CommitGate {
    cancelled: Mutex<bool>,
}

impl CommitGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.cancelled.lock() {
            Ok(cancelled) => cancelled,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cancel(&self) {
        *self.lock() = true;
    }

    fn is_cancelled(&self) -> bool {
        *self.lock()
    }
}

/// Cancels the gate when dropped while still armed.
struct CancelOnDrop {
    gate: Arc<CommitGate>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.gate.cancel();
        }
    }
}

/// Decoded audio before any processing.
#[derive(Debug)]
struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

pub struct AudioNormalizer {
    config: AudioConfig,
    transcoder: Demuxer,
}

impl AudioNormalizer {
    pub fn new(config: AudioConfig) -> Self {
        let transcoder = Demuxer::new(config.ffmpeg_path.clone());
        Self { config, transcoder }
    }

    /// Where the normalized WAV for `input` ends up.
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        self.config.normalized_dir.join(format!("{}.wav", stem))
    }

    /// Every file `normalize(input)` may create besides its input: the
    /// output, the output's `.part` file and the ffmpeg transcode.
    pub fn scratch_paths_for(&self, input: &Path) -> Vec<PathBuf> {
        let output = self.output_path_for(input);
        vec![part_path(&output), output, self.transcode_path_for(input)]
    }

    /// Normalize `input` and return the path of the canonical WAV.
    ///
    /// `input` is deleted once the output is written. If anything fails before
    /// that, it is left in place.
    ///
    /// Dropping the returned future part way through never publishes the
    /// output later: the background writer discards its `.part` file instead
    /// of renaming it. Any transcode left behind is listed by
    /// [`AudioNormalizer::scratch_paths_for`].
    pub async fn normalize(&self, input: &Path) -> Result<PathBuf, JobError> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(JobError::FileNotFound(input.to_path_buf()));
        }

        let decoded = self.decode_with_fallback(input).await?;
        let source_rate = decoded.sample_rate;

        let min_duration_ms = self.config.min_duration_ms;
        let pad_silence_ms = self.config.pad_silence_ms;
        let samples = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, JobError> {
            let mut samples = resample(&decoded.samples, decoded.sample_rate, TARGET_SAMPLE_RATE)?;
            peak_normalize(&mut samples);
            pad_if_short(&mut samples, min_duration_ms, pad_silence_ms);
            Ok(samples)
        })
        .await
        .map_err(|e| JobError::Decode(format!("normalization task failed: {}", e)))??;

        tokio::fs::create_dir_all(&self.config.normalized_dir).await?;
        let output = self.output_path_for(input);
        let target = output.clone();
        let sample_count = samples.len();
        let gate = Arc::new(CommitGate::default());
        let mut cancel_on_drop = CancelOnDrop {
            gate: gate.clone(),
            armed: true,
        };
        let written = tokio::task::spawn_blocking(move || write_wav_atomic(&target, &samples, &gate)).await;
        cancel_on_drop.armed = false;
        written.map_err(|e| JobError::Io(std::io::Error::other(e)))??;

        info!(
            input = %input.display(),
            output = %output.display(),
            source_rate,
            duration_ms = duration_ms(sample_count),
            "Audio normalized"
        );

        if output != input {
            cleanup::remove_best_effort(input).await;
        }
        Ok(output)
    }

    async fn decode_with_fallback(&self, input: &Path) -> Result<DecodedAudio, JobError> {
        let path = input.to_path_buf();
        let first_attempt = tokio::task::spawn_blocking(move || decode_file(&path))
            .await
            .map_err(|e| JobError::Decode(format!("decoder task failed: {}", e)))?;

        let reason = match first_attempt {
            Ok(decoded) => return Ok(decoded),
            Err(DecodeFailure::Invalid(msg)) => return Err(JobError::Decode(msg)),
            Err(DecodeFailure::Unsupported(msg)) => msg,
        };

        debug!(input = %input.display(), reason = %reason, "Falling back to ffmpeg transcoding");

        let transcoded = self.transcode_path_for(input);
        if let Err(detail) = self.transcoder.convert_to_wav(input, &transcoded).await {
            cleanup::remove_best_effort(&transcoded).await;
            return Err(JobError::Decode(format!("{}; ffmpeg fallback: {}", reason, detail)));
        }

        let path = transcoded.clone();
        let second_attempt = tokio::task::spawn_blocking(move || decode_file(&path))
            .await
            .map_err(|e| JobError::Decode(format!("decoder task failed: {}", e)));
        cleanup::remove_best_effort(&transcoded).await;

        second_attempt?.map_err(|failure| JobError::Decode(failure.message().to_string()))
    }

    fn transcode_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        self.config
            .normalized_dir
            .join(format!("{}.transcoded.wav", stem))
    }
}

/// Decode every packet of the default track into mono f32 samples.
fn decode_file(path: &Path) -> Result<DecodedAudio, DecodeFailure> {
    let file = File::open(path).map_err(|e| DecodeFailure::Invalid(format!("open: {}", e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_of(path) {
        hint.with_extension(&ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| classify("probe", e))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DecodeFailure::Invalid("no audio track found".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| classify("codec", e))?;

    let mut sample_rate = codec_params.sample_rate;
    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(classify("packet", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(classify("decode", e)),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        if sample_rate.is_none() {
            sample_rate = Some(spec.rate);
        }

        let mut buffer = SampleBuffer::<f32>::new(frames as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        downmix_into(buffer.samples(), spec.channels.count(), &mut mono);
    }

    let sample_rate =
        sample_rate.ok_or_else(|| DecodeFailure::Invalid("unknown sample rate".to_string()))?;
    if mono.is_empty() {
        return Err(DecodeFailure::Invalid("no audio samples decoded".to_string()));
    }

    Ok(DecodedAudio {
        samples: mono,
        sample_rate,
    })
}

/// Average interleaved frames of `channels` samples into `out`.
fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
    );
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, JobError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| JobError::Decode(format!("resampler init: {}", e)))?;

    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected_len + delay + chunk_size);

    // One extra chunk of zeros flushes the filter delay out of the resampler.
    let mut padded = samples.to_vec();
    let tail = (chunk_size - samples.len() % chunk_size) % chunk_size;
    padded.resize(samples.len() + tail + chunk_size, 0.0);

    for chunk in padded.chunks(chunk_size) {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| JobError::Decode(format!("resample: {}", e)))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    let end = (delay + expected_len).min(output.len());
    Ok(output[delay.min(end)..end].to_vec())
}

/// Scale so the loudest sample sits at -0.1 dBFS. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak < SILENCE_FLOOR {
        return;
    }

    let target = 10f32.powf(PEAK_HEADROOM_DBFS / 20.0);
    let gain = target / peak;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

/// Append `pad_ms` of silence when the clip is shorter than `min_ms`.
///
/// Returns whether padding was applied.
pub fn pad_if_short(samples: &mut Vec<f32>, min_ms: u64, pad_ms: u64) -> bool {
    if duration_ms(samples.len()) >= min_ms {
        return false;
    }
    let pad_samples = (pad_ms * TARGET_SAMPLE_RATE as u64 / 1000) as usize;
    samples.resize(samples.len() + pad_samples, 0.0);
    true
}

fn duration_ms(sample_count: usize) -> u64 {
    sample_count as u64 * 1000 / TARGET_SAMPLE_RATE as u64
}

fn part_path(path: &Path) -> PathBuf {
    let mut part_name = path.as_os_str().to_owned();
    part_name.push(".part");
    PathBuf::from(part_name)
}

fn cancelled_write() -> JobError {
    JobError::Io(std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        "normalization was cancelled",
    ))
}

/// Write 16-bit mono PCM to `<path>.part`, sync it, then rename over `path`
/// unless `gate` was cancelled in the meantime.
fn write_wav_atomic(path: &Path, samples: &[f32], gate: &CommitGate) -> Result<(), JobError> {
    if gate.is_cancelled() {
        return Err(cancelled_write());
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let part = part_path(path);

    let written = (|| -> Result<(), hound::Error> {
        let mut writer = hound::WavWriter::create(&part, spec)?;
        for &sample in samples {
            let value = (sample * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32);
            writer.write_sample(value as i16)?;
        }
        writer.finalize()
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&part);
        return Err(match e {
            hound::Error::IoError(io) => JobError::Io(io),
            other => JobError::Io(std::io::Error::other(other.to_string())),
        });
    }

    File::open(&part)?.sync_all()?;

    let cancelled = gate.lock();
    if *cancelled {
        let _ = std::fs::remove_file(&part);
        return Err(cancelled_write());
    }
    std::fs::rename(&part, path)?;
    Ok(())
}
