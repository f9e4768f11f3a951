//! # Whisper Model (candle)
//!
//! Loads Whisper weights with candle and implements [`SpeechModel`] on top of
//! them.
//!
//! ## Inference Process:
//! 1. Split the audio into 30 second windows
//! 2. Log-mel spectrogram per window (Slaney mel filterbank, computed once)
//! 3. Encoder forward pass
//! 4. Beam-search decoding with the prompt
//!    `<|startoftranscript|><|lang|><|transcribe|><|notimestamps|>`
//! 5. One segment per window that produced text, timed by window boundaries

use crate::device::{DeviceManager, DevicePreference, Precision};
use crate::transcription::engine::{DecodeOptions, SpeechModel, TranscriptSegment};
use crate::transcription::lifecycle::{LoadedModel, ModelLoader};
use crate::transcription::source::{ModelFiles, ModelResolver};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Ids of the control tokens used in the decoding prompt.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no {} token", token))
        };
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
        })
    }
}

pub struct WhisperModel {
    /// Decoding mutates the attention caches, hence the lock
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
    dtype: DType,
    tokens: SpecialTokens,
    /// Token ids that may never be generated
    suppressed: Vec<u32>,
}

impl WhisperModel {
    /// Load weights, tokenizer and config from `files`. Blocking.
    pub fn load(files: &ModelFiles, device: Device, dtype: DType) -> Result<Self> {
        let started = std::time::Instant::now();

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("opening {}", files.config.display()))?,
        )
        .context("parsing model config")?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        // Safety: the weights file is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone()).context("building Whisper graph")?;

        let mel_filters = mel_filterbank(m::SAMPLE_RATE, m::N_FFT, config.num_mel_bins);

        let vocab = config.vocab_size as u32;
        let mut suppressed: Vec<u32> = config
            .suppress_tokens
            .iter()
            .copied()
            .filter(|&id| id < vocab)
            .collect();
        // Everything after <|endoftext|> is a control or timestamp token
        suppressed.extend(tokens.eot + 1..vocab);
        suppressed.sort_unstable();
        suppressed.dedup();

        info!(
            device = %DeviceManager::get_device_info(&device),
            dtype = ?dtype,
            mel_bins = config.num_mel_bins,
            load_secs = started.elapsed().as_secs_f64(),
            "Whisper weights loaded"
        );

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            mel_filters,
            device,
            dtype,
            tokens,
            suppressed,
        })
    }

    fn language_token(&self, language: &str) -> Result<u32> {
        let token = format!("<|{}|>", language);
        self.tokenizer
            .token_to_id(&token)
            .ok_or_else(|| anyhow!("language '{}' is not supported by this model", language))
    }

    /// Log-mel features for one window, padded to exactly `N_FRAMES` frames.
    fn window_features(&self, window: &[f32]) -> Result<Tensor> {
        let mut padded = window.to_vec();
        padded.resize(m::N_SAMPLES, 0.0);

        let mel = audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;

        let mut features = vec![0.0f32; n_mels * m::N_FRAMES];
        let copy = n_frames.min(m::N_FRAMES);
        for bin in 0..n_mels {
            let src = bin * n_frames;
            let dst = bin * m::N_FRAMES;
            features[dst..dst + copy].copy_from_slice(&mel[src..src + copy]);
        }

        Ok(Tensor::from_vec(features, (1, n_mels, m::N_FRAMES), &self.device)?.to_dtype(self.dtype)?)
    }

    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        features: &Tensor,
        prompt: &[u32],
        opts: &DecodeOptions,
    ) -> Result<Vec<u32>> {
        let audio_features = model.encoder.forward(features, true)?;
        let (_, n_ctx, n_state) = audio_features.dims3()?;
        let beam_size = opts.beam_size.max(1);
        let max_tokens = opts.max_tokens.min(self.config.max_target_positions / 2);

        let mut beams = vec![Hypothesis::default()];
        for step in 0..max_tokens {
            let live: Vec<&Hypothesis> = beams.iter().filter(|h| !h.finished).collect();
            if live.is_empty() {
                break;
            }

            let seq_len = prompt.len() + step;
            let mut flat = Vec::with_capacity(live.len() * seq_len);
            for hypothesis in &live {
                flat.extend_from_slice(prompt);
                flat.extend_from_slice(&hypothesis.tokens);
            }
            let input = Tensor::new(flat.as_slice(), &self.device)?.reshape((live.len(), seq_len))?;
            let cross = audio_features
                .broadcast_as((live.len(), n_ctx, n_state))?
                .contiguous()?;

            let hidden = model.decoder.forward(&input, &cross, true)?;
            let logits = model
                .decoder
                .final_linear(&hidden.i((.., seq_len - 1..seq_len, ..))?)?
                .squeeze(1)?
                .to_dtype(DType::F32)?;
            let mut rows = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

            for row in rows.iter_mut() {
                for &id in &self.suppressed {
                    if let Some(lp) = row.get_mut(id as usize) {
                        *lp = f32::NEG_INFINITY;
                    }
                }
                if step == 0 {
                    // No empty transcripts
                    row[self.tokens.eot as usize] = f32::NEG_INFINITY;
                }
            }

            beams = advance_beams(&beams, &rows, beam_size, self.tokens.eot);
        }

        Ok(best_hypothesis(&beams)
            .map(|h| h.text_tokens(self.tokens.eot).to_vec())
            .unwrap_or_default())
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(&self, pcm: &[f32], opts: &DecodeOptions) -> Result<Vec<TranscriptSegment>> {
        if pcm.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = [
            self.tokens.sot,
            self.language_token(&opts.language)?,
            self.tokens.transcribe,
            self.tokens.no_timestamps,
        ];

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model state poisoned by an earlier panic"))?;

        let sample_rate = m::SAMPLE_RATE as f64;
        let total_secs = pcm.len() as f64 / sample_rate;
        let windows = pcm.len().div_ceil(m::N_SAMPLES);
        let mut segments = Vec::new();

        for (index, window) in pcm.chunks(m::N_SAMPLES).enumerate() {
            let start = (index * m::N_SAMPLES) as f64 / sample_rate;
            let end = (start + window.len() as f64 / sample_rate).min(total_secs);

            model.decoder.reset_kv_cache();
            let features = self.window_features(window)?;
            let tokens = self.decode_window(&mut model, &features, &prompt, opts)?;
            let text = self
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| anyhow!("tokenizer decode error: {}", e))?;
            let text = text.trim();

            debug!(window = index + 1, windows, start, end, tokens = tokens.len(), "Window decoded");
            if !text.is_empty() {
                segments.push(TranscriptSegment::new(text, start, end));
            }
        }

        Ok(segments)
    }
}

/// One beam: generated tokens (prompt excluded) and their summed log-probability.
#[derive(Debug, Clone, Default, PartialEq)]
struct Hypothesis {
    tokens: Vec<u32>,
    logprob: f32,
    finished: bool,
}

impl Hypothesis {
    fn text_tokens(&self, eot: u32) -> &[u32] {
        match self.tokens.last() {
            Some(&last) if last == eot => &self.tokens[..self.tokens.len() - 1],
            _ => &self.tokens,
        }
    }

    /// Length-normalized score used for the final pick.
    fn score(&self) -> f32 {
        self.logprob / (self.tokens.len().max(1) as f32)
    }
}

/// Extend every live beam with its best continuations and keep the top
/// `beam_size` hypotheses overall. `rows[i]` holds log-probabilities for the
/// i-th live (unfinished) beam.
fn advance_beams(beams: &[Hypothesis], rows: &[Vec<f32>], beam_size: usize, eot: u32) -> Vec<Hypothesis> {
    let mut pool: Vec<Hypothesis> = beams.iter().filter(|h| h.finished).cloned().collect();

    for (hypothesis, row) in beams.iter().filter(|h| !h.finished).zip(rows) {
        let mut candidates: Vec<(u32, f32)> = row
            .iter()
            .enumerate()
            .filter(|(_, lp)| lp.is_finite())
            .map(|(id, &lp)| (id as u32, lp))
            .collect();
        let by_logprob = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1);
        if candidates.len() > beam_size {
            candidates.select_nth_unstable_by(beam_size, by_logprob);
            candidates.truncate(beam_size);
        }

        for (token, lp) in candidates {
            let mut tokens = hypothesis.tokens.clone();
            tokens.push(token);
            pool.push(Hypothesis {
                tokens,
                logprob: hypothesis.logprob + lp,
                finished: token == eot,
            });
        }
    }

    pool.sort_by(|a, b| b.logprob.total_cmp(&a.logprob));
    pool.truncate(beam_size);
    pool
}

fn best_hypothesis(beams: &[Hypothesis]) -> Option<&Hypothesis> {
    beams.iter().max_by(|a, b| a.score().total_cmp(&b.score()))
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-style mel filterbank, laid out `[n_mels][n_fft / 2 + 1]`.
///
/// Same construction as librosa's `filters.mel(sr, n_fft, n_mels)` that
/// Whisper was trained with: triangles on the Slaney mel scale, area
/// normalized.
fn mel_filterbank(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * nyquist / (n_bins - 1) as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for mel in 0..n_mels {
        let (left, center, right) = (mel_points[mel], mel_points[mel + 1], mel_points[mel + 2]);
        let norm = 2.0 / (right - left);
        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[mel * n_bins + bin] = (weight * norm) as f32;
        }
    }
    filters
}

/// Builds [`WhisperModel`]s for the lifecycle manager.
pub struct WhisperLoader {
    resolver: ModelResolver,
    device: DevicePreference,
    precision: Precision,
}

impl WhisperLoader {
    pub fn new(resolver: ModelResolver, device: DevicePreference, precision: Precision) -> Self {
        Self {
            resolver,
            device,
            precision,
        }
    }
}

#[async_trait]
impl ModelLoader for WhisperLoader {
    async fn load(&self) -> Result<LoadedModel> {
        let (files, source) = self.resolver.resolve().await?;
        let device = DeviceManager::get_device(self.device);
        let dtype = self.precision.dtype_for(&device);

        let model = tokio::task::spawn_blocking(move || WhisperModel::load(&files, device, dtype))
            .await
            .map_err(|e| anyhow!("model loading task failed: {}", e))??;

        Ok(LoadedModel {
            model: Arc::new(model),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: u32 = 9;

    fn row(entries: &[(usize, f32)]) -> Vec<f32> {
        let mut row = vec![f32::NEG_INFINITY; 10];
        for &(id, lp) in entries {
            row[id] = lp;
        }
        row
    }

    #[test]
    fn test_mel_scale_reference_points() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((mel_to_hz(15.0) - 1000.0).abs() < 1e-6);
        assert!((mel_to_hz(hz_to_mel(4000.0)) - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn test_filterbank_shape_and_coverage() {
        let filters = mel_filterbank(16_000, 400, 80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));
        for mel in 0..80 {
            let row = &filters[mel * 201..(mel + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "mel band {} is empty", mel);
        }
    }

    #[test]
    fn test_beam_keeps_best_overall_candidates() {
        let beams = vec![
            Hypothesis { tokens: vec![1], logprob: -0.1, finished: false },
            Hypothesis { tokens: vec![2], logprob: -2.0, finished: false },
        ];
        let rows = vec![
            row(&[(3, -0.5), (4, -3.0), (EOT as usize, -1.0)]),
            row(&[(5, -0.01)]),
        ];

        let next = advance_beams(&beams, &rows, 2, EOT);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].tokens, vec![1, 3]);
        assert_eq!(next[1].tokens, vec![1, EOT]);
        assert!(next[1].finished);
    }

    #[test]
    fn test_finished_beams_carry_over() {
        let beams = vec![
            Hypothesis { tokens: vec![1, EOT], logprob: -0.2, finished: true },
            Hypothesis { tokens: vec![2], logprob: -0.3, finished: false },
        ];
        let rows = vec![row(&[(6, -5.0), (7, -6.0)])];

        let next = advance_beams(&beams, &rows, 2, EOT);
        assert_eq!(next[0].tokens, vec![1, EOT]);
        assert_eq!(next[1].tokens, vec![2, 6]);
    }

    #[test]
    fn test_best_hypothesis_is_length_normalized() {
        let short = Hypothesis { tokens: vec![1, EOT], logprob: -2.0, finished: true };
        let long = Hypothesis { tokens: vec![1, 2, 3, 4, EOT], logprob: -3.0, finished: true };
        let beams = [short, long.clone()];

        let best = best_hypothesis(&beams).unwrap();
        assert_eq!(best, &long);
        assert_eq!(best.text_tokens(EOT), &[1, 2, 3, 4]);
    }
}
