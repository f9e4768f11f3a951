//! # Job Queue
//!
//! Unbounded FIFO between the front door (many submitters) and the single
//! transcription worker. Built on a tokio unbounded mpsc channel so submission
//! never blocks; the receiving half is owned by exactly one worker, which is
//! what guarantees that at most one job is processed at a time.
//!
//! ## Components:
//! - **JobQueue**: cloneable submitting handle
//! - **JobReceiver**: the consuming half, owned by the worker
//! - **TakenJob**: a job handed to the worker, marked busy until dropped

pub mod job;
pub mod worker;

pub use job::{Job, JobId};
pub use worker::Worker;

use serde::Serialize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// Pending count and busy marker change together under one lock, so a
/// submitter never sees a job that has left the queue but is not yet busy.
#[derive(Debug, Default)]
struct Counts {
    /// Jobs submitted but not yet taken by the worker
    pending: usize,
    busy: Option<JobId>,
}

/// State shared by every handle of one queue.
#[derive(Debug, Default)]
struct Shared {
    counts: Mutex<Counts>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn counts(&self) -> MutexGuard<'_, Counts> {
        match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Submitting half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
}

/// Consuming half of the queue.
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
}

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub busy_job: Option<JobId>,
    pub accepting: bool,
}

impl JobQueue {
    pub fn new() -> (JobQueue, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        (
            JobQueue {
                tx,
                shared: shared.clone(),
            },
            JobReceiver { rx, shared },
        )
    }

    /// Append `job` to the tail.
    ///
    /// Returns how many jobs were ahead of it: pending ones plus the one being
    /// processed, if any.
    pub fn submit(&self, job: Job) -> Result<usize, QueueError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let job_id = job.id.clone();
        let mut counts = self.shared.counts();
        let ahead = counts.pending + usize::from(counts.busy.is_some());

        // The receiver takes the counts lock before decrementing, so it cannot
        // account for this job until the increment below is visible.
        self.tx.send(job).map_err(|_| QueueError::Closed)?;
        counts.pending += 1;
        drop(counts);

        debug!(job_id = %job_id, ahead, "Job enqueued");
        Ok(ahead)
    }

    /// Number of jobs waiting to be taken. Never blocks on the worker.
    pub fn size(&self) -> usize {
        self.shared.counts().pending
    }

    /// Whether the worker is processing a job right now.
    pub fn is_busy(&self) -> bool {
        self.shared.counts().busy.is_some()
    }

    /// Stop accepting jobs and wake the worker if it is idle.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            info!(pending = self.size(), "Job queue closed");
            self.shared.shutdown.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let counts = self.shared.counts();
        QueueSnapshot {
            pending: counts.pending,
            busy_job: counts.busy.clone(),
            accepting: !self.is_closed(),
        }
    }
}

impl JobReceiver {
    /// Wait for the next job in submission order.
    ///
    /// The job leaves the pending count and becomes the busy job in one step;
    /// it stays busy until the returned [`TakenJob`] is dropped.
    ///
    /// Returns `None` as soon as the queue is closed. Jobs still waiting at that
    /// point are not handed out here; collect them with [`JobReceiver::drain`].
    pub async fn take(&mut self) -> Option<TakenJob> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }

        let job = tokio::select! {
            biased;
            _ = self.shared.shutdown.notified() => None,
            job = self.rx.recv() => job,
        }?;

        let mut counts = self.shared.counts();
        counts.pending = counts.pending.saturating_sub(1);
        counts.busy = Some(job.id.clone());
        drop(counts);

        Some(TakenJob {
            job,
            shared: self.shared.clone(),
        })
    }

    /// Close the channel and return every job that was never taken.
    pub fn drain(&mut self) -> Vec<Job> {
        self.rx.close();
        let mut leftover = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            let mut counts = self.shared.counts();
            counts.pending = counts.pending.saturating_sub(1);
            leftover.push(job);
        }
        leftover
    }
}

/// The job the worker is processing. Clears the busy marker on drop.
#[derive(Debug)]
pub struct TakenJob {
    job: Job,
    shared: Arc<Shared>,
}

impl Deref for TakenJob {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl Drop for TakenJob {
    fn drop(&mut self) {
        self.shared.counts().busy = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::MediaKind;
    use std::path::PathBuf;
    use std::time::Duration;

    fn job(id: &str) -> Job {
        Job::new(
            JobId::new(id),
            "chat-1",
            PathBuf::from(format!("{}.ogg", id)),
            MediaKind::Voice,
            false,
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut receiver) = JobQueue::new();
        for id in ["j1", "j2", "j3"] {
            queue.submit(job(id)).unwrap();
        }

        for expected in ["j1", "j2", "j3"] {
            let taken = receiver.take().await.unwrap();
            assert_eq!(taken.id.as_str(), expected);
        }
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_position_counts_pending_and_busy() {
        let (queue, mut receiver) = JobQueue::new();
        assert_eq!(queue.submit(job("j1")).unwrap(), 0);
        assert_eq!(queue.submit(job("j2")).unwrap(), 1);
        assert_eq!(queue.submit(job("j3")).unwrap(), 2);
        assert_eq!(queue.size(), 3);

        let _first = receiver.take().await.unwrap();
        // j2 and j3 waiting, j1 in progress
        assert_eq!(queue.submit(job("j4")).unwrap(), 3);
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.snapshot().busy_job, Some(JobId::new("j1")));
    }

    #[tokio::test]
    async fn test_taken_job_is_busy_until_dropped() {
        let (queue, mut receiver) = JobQueue::new();
        queue.submit(job("j1")).unwrap();
        {
            let taken = receiver.take().await.unwrap();
            assert_eq!(taken.id.as_str(), "j1");
            assert!(queue.is_busy());
        }
        assert!(!queue.is_busy());
        assert_eq!(queue.snapshot().busy_job, None);
    }

    #[tokio::test]
    async fn test_position_right_after_take_counts_busy_job() {
        let (queue, mut receiver) = JobQueue::new();
        queue.submit(job("j1")).unwrap();
        queue.submit(job("j2")).unwrap();

        // No gap between leaving the queue and becoming busy: a submission
        // landing right after take() still sees two jobs ahead.
        let _taken = receiver.take().await.unwrap();
        assert_eq!(queue.submit(job("j3")).unwrap(), 2);
        assert_eq!(queue.snapshot().pending, 2);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_see_consistent_positions() {
        let (queue, mut receiver) = JobQueue::new();
        let consumer = tokio::spawn(async move {
            let mut taken = 0;
            while let Some(job) = receiver.take().await {
                drop(job);
                taken += 1;
                if taken == 200 {
                    break;
                }
            }
            taken
        });

        let mut positions = Vec::new();
        for i in 0..200 {
            positions.push(queue.submit(job(&format!("j{}", i))).unwrap());
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(consumer.await.unwrap(), 200);
        // Every job was either pending or busy when counted, so no position
        // can exceed the number of jobs submitted before it.
        for (i, position) in positions.iter().enumerate() {
            assert!(*position <= i, "job {} saw {} ahead", i, position);
        }
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_submissions() {
        let (queue, _receiver) = JobQueue::new();
        queue.close();
        assert_eq!(queue.submit(job("late")), Err(QueueError::Closed));
        assert_eq!(queue.size(), 0);
        assert!(!queue.snapshot().accepting);
    }

    #[tokio::test]
    async fn test_close_wakes_idle_worker() {
        let (queue, mut receiver) = JobQueue::new();
        let waiter = tokio::spawn(async move { receiver.take().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker should wake up")
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn test_drain_returns_untaken_jobs() {
        let (queue, mut receiver) = JobQueue::new();
        queue.submit(job("j1")).unwrap();
        queue.submit(job("j2")).unwrap();
        queue.close();

        assert!(receiver.take().await.is_none());
        let leftover = receiver.drain();
        let ids: Vec<_> = leftover.iter().map(|j| j.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["j1", "j2"]);
        assert_eq!(queue.size(), 0);
    }
}
