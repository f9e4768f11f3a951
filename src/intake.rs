//! # Job Intake
//!
//! Transport-neutral front door. Validates a stored upload, turns it into a
//! [`Job`] and appends it to the queue. Rejected uploads never reach the queue
//! and their files are removed right away.

use crate::audio::format::{requires_demux, MediaKind};
use crate::cleanup;
use crate::delivery::Delivery;
use crate::error::IntakeError;
use crate::queue::{Job, JobId, JobQueue};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    /// Jobs ahead of this one when it was enqueued
    pub position: usize,
}

#[derive(Clone)]
pub struct Intake {
    queue: JobQueue,
    delivery: Arc<dyn Delivery>,
}

impl Intake {
    pub fn new(queue: JobQueue, delivery: Arc<dyn Delivery>) -> Self {
        Self { queue, delivery }
    }

    /// Enqueue the file at `source_path` for transcription.
    ///
    /// Ownership of the file passes to the pipeline: it is deleted on
    /// rejection here, or by the worker once the job is finished. When other
    /// jobs are ahead, the submitter is told its position through `reply_to`.
    pub async fn submit(
        &self,
        reply_to: &str,
        source_path: PathBuf,
        kind: MediaKind,
        id: Option<JobId>,
    ) -> Result<Submission, IntakeError> {
        let needs_demux = match requires_demux(&source_path, kind) {
            Ok(needs_demux) => needs_demux,
            Err(e) => {
                warn!(path = %source_path.display(), %kind, error = %e, "Upload rejected");
                cleanup::remove_best_effort(&source_path).await;
                return Err(e);
            }
        };

        let job_id = id.unwrap_or_else(JobId::generate);
        let job = Job::new(job_id.clone(), reply_to, source_path.clone(), kind, needs_demux);

        let position = match self.queue.submit(job) {
            Ok(position) => position,
            Err(_) => {
                cleanup::remove_best_effort(&source_path).await;
                return Err(IntakeError::QueueClosed);
            }
        };

        info!(job_id = %job_id, reply_to, %kind, needs_demux, position, "Job accepted");

        if position > 0 {
            let notice = position_message(position);
            if let Err(e) = self.delivery.send(reply_to, &notice).await {
                warn!(reply_to, error = %e, "Failed to deliver queue position");
            }
        }

        Ok(Submission { job_id, position })
    }
}

pub fn position_message(position: usize) -> String {
    format!("Your file is queued. Files ahead of it: {}", position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDelivery;

    fn setup() -> (Intake, JobQueue, crate::queue::JobReceiver, Arc<RecordingDelivery>) {
        let (queue, receiver) = JobQueue::new();
        let delivery = RecordingDelivery::new();
        let intake = Intake::new(queue.clone(), delivery.clone());
        (intake, queue, receiver, delivery)
    }

    #[tokio::test]
    async fn test_first_job_gets_no_position_notice() {
        let (intake, queue, _rx, delivery) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.ogg");
        std::fs::write(&path, b"ogg").unwrap();

        let submission = intake.submit("chat-1", path, MediaKind::Voice, None).await.unwrap();
        assert_eq!(submission.position, 0);
        assert_eq!(queue.size(), 1);
        assert!(delivery.messages().is_empty());
    }

    #[tokio::test]
    async fn test_third_submitter_sees_two_ahead() {
        let (intake, _queue, mut receiver, delivery) = setup();
        let dir = tempfile::tempdir().unwrap();

        for (i, reply_to) in ["u1", "u2", "u3"].iter().enumerate() {
            let path = dir.path().join(format!("{}.mp3", reply_to));
            std::fs::write(&path, b"mp3").unwrap();
            let submission = intake
                .submit(reply_to, path, MediaKind::Audio, Some(JobId::new(*reply_to)))
                .await
                .unwrap();
            assert_eq!(submission.position, i);
        }

        assert_eq!(delivery.texts_for("u3"), vec![position_message(2)]);
        assert!(delivery.texts_for("u1").is_empty());

        let first = receiver.take().await.unwrap();
        assert_eq!(first.id.as_str(), "u1");
    }

    #[tokio::test]
    async fn test_unsupported_format_rejected_before_enqueue() {
        let (intake, queue, _rx, delivery) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.avi");
        std::fs::write(&path, b"avi").unwrap();

        let err = intake
            .submit("chat-1", path.clone(), MediaKind::Video, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::UnsupportedFormat(ref ext) if ext == ".avi"));
        assert_eq!(queue.size(), 0);
        assert!(!path.exists());
        assert!(delivery.messages().is_empty());
    }

    #[tokio::test]
    async fn test_video_is_marked_for_demux() {
        let (intake, _queue, mut receiver, _delivery) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"mp4").unwrap();

        intake.submit("chat-1", path, MediaKind::VideoNote, None).await.unwrap();
        assert!(receiver.take().await.unwrap().needs_demux);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_removes_upload() {
        let (intake, queue, _rx, _delivery) = setup();
        queue.close();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.wav");
        std::fs::write(&path, b"wav").unwrap();

        let err = intake.submit("chat-1", path.clone(), MediaKind::Audio, None).await.unwrap_err();
        assert!(matches!(err, IntakeError::QueueClosed));
        assert!(!path.exists());
    }
}
