//! # Transcription Worker
//!
//! The single consumer of the job queue. Processes one job at a time:
//! demux (videos only) → normalize → lease model → transcribe → chunk →
//! deliver, then removes every file the job produced whether it succeeded or
//! not. A failed job never stops the loop.

use crate::audio::{AudioNormalizer, Demuxer};
use crate::chunker;
use crate::cleanup;
use crate::config::AppConfig;
use crate::delivery::Delivery;
use crate::error::JobError;
use crate::queue::{Job, JobReceiver, TakenJob};
use crate::transcription::{join_segments, DecodeOptions, ModelManager, TranscriptionEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const NO_SPEECH_MESSAGE: &str = "No speech was recognized in this file.";
pub const SHUTDOWN_NOTICE: &str =
    "The service is shutting down and your file was not processed. Please send it again later.";

pub struct Worker {
    receiver: JobReceiver,
    demuxer: Demuxer,
    normalizer: AudioNormalizer,
    models: Arc<ModelManager>,
    engine: TranscriptionEngine,
    delivery: Arc<dyn Delivery>,
    chunk_size: usize,
    job_timeout: Option<Duration>,
}

impl Worker {
    pub fn new(
        receiver: JobReceiver,
        config: &AppConfig,
        models: Arc<ModelManager>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            receiver,
            demuxer: Demuxer::new(config.audio.ffmpeg_path.clone()),
            normalizer: AudioNormalizer::new(config.audio.clone()),
            models,
            engine: TranscriptionEngine::new(DecodeOptions {
                language: config.models.language.clone(),
                beam_size: config.models.beam_size,
                max_tokens: config.models.max_tokens_per_window,
            }),
            delivery,
            chunk_size: config.queue.chunk_size,
            job_timeout: config.job_timeout(),
        }
    }

    /// Consume jobs until the queue is closed, then discard whatever is left.
    pub async fn run(mut self) {
        info!("Transcription worker started");

        while let Some(job) = self.receiver.take().await {
            let span = info_span!(
                "job",
                job_id = %job.id,
                reply_to = %job.reply_to,
                kind = %job.kind,
            );
            self.handle(job).instrument(span).await;
        }

        let leftover = self.receiver.drain();
        if !leftover.is_empty() {
            info!(count = leftover.len(), "Discarding queued jobs on shutdown");
        }
        for job in leftover {
            self.send(&job.reply_to, SHUTDOWN_NOTICE).await;
            cleanup::remove_best_effort(&job.source_path).await;
        }

        info!("Transcription worker stopped");
    }

    /// Run one job. It stays marked busy until `job` is dropped at the end.
    async fn handle(&self, job: TakenJob) {
        let waited = chrono::Utc::now() - job.submitted_at;
        info!(waited_ms = waited.num_milliseconds(), "Job started");

        let started = Instant::now();
        let outcome = match self.job_timeout {
            Some(limit) => tokio::time::timeout(limit, self.process(&job))
                .await
                .unwrap_or(Err(JobError::Timeout(limit))),
            None => self.process(&job).await,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(chunks) => {
                info!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    chunks = chunks.len(),
                    "Job completed"
                );
                self.send(&job.reply_to, &processing_time_message(elapsed)).await;
                if chunks.is_empty() {
                    self.send(&job.reply_to, NO_SPEECH_MESSAGE).await;
                }
                for chunk in &chunks {
                    self.send(&job.reply_to, chunk).await;
                }
            }
            Err(e) => {
                warn!(
                    error_kind = e.kind(),
                    error = %e,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Job failed"
                );
                self.send(&job.reply_to, &e.user_message()).await;
            }
        }

        cleanup::remove_all_best_effort(self.scratch_files(&job).iter().map(PathBuf::as_path)).await;
        drop(job);
    }

    /// The pipeline proper. The model lease is dropped when this returns.
    async fn process(&self, job: &Job) -> Result<Vec<String>, JobError> {
        let audio_path = if job.needs_demux {
            debug!("Extracting audio track");
            self.demuxer.extract_audio(&job.source_path).await?
        } else {
            job.source_path.clone()
        };

        let wav = self.normalizer.normalize(&audio_path).await?;
        let lease = self.models.acquire().await?;
        let segments = self.engine.transcribe(&lease, &wav).await?;
        lease.release();

        let text = join_segments(&segments);
        Ok(chunker::chunk(&text, self.chunk_size))
    }

    /// Every file this job may have left behind, existing or not.
    fn scratch_files(&self, job: &Job) -> Vec<PathBuf> {
        let mut files = vec![job.source_path.clone()];
        let mut audio = job.source_path.clone();
        if job.needs_demux {
            audio = Demuxer::output_path_for(&job.source_path);
            files.push(audio.clone());
        }
        files.extend(self.normalizer.scratch_paths_for(&audio));
        files
    }

    async fn send(&self, reply_to: &str, text: &str) {
        if let Err(e) = self.delivery.send(reply_to, text).await {
            error!(reply_to, error = %e, "Failed to deliver message");
        }
    }
}

pub fn processing_time_message(elapsed: Duration) -> String {
    format!("Processing time: {:.2} s", elapsed.as_secs_f64())
}
