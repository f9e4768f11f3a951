//! # Model Lifecycle
//!
//! Owns the single speech model instance. The model is expensive to load and
//! holds gigabytes of (accelerator) memory, so it is loaded on first use and
//! dropped again after a period without work.
//!
//! ## State Machine:
//! ```text
//! Unloaded --acquire--> Loading --ok--> Ready --(idle, no leases)--> Unloaded
//!                          |
//!                          +----err----> Unloaded
//! ```
//!
//! ## Guarantees:
//! - Only one load is in flight; concurrent callers share its result. The load
//!   runs in a task owned by the manager, so a caller that gives up does not
//!   cancel it; the next caller joins the same load
//! - At most one model is resident per manager: eviction and loading both hold
//!   the load gate
//! - Eviction never happens while a lease is outstanding: the reaper checks
//!   the lease counter and the last-release time under the same lock that
//!   leases use, right before dropping the model

use crate::error::JobError;
use crate::transcription::engine::SpeechModel;
use crate::transcription::source::ModelSource;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// A freshly loaded model and where it came from.
pub struct LoadedModel {
    pub model: Arc<dyn SpeechModel>,
    pub source: ModelSource,
}

/// Produces a ready-to-use model. Runs on its own task, one at a time.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<LoadedModel>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStateKind {
    Unloaded,
    Loading,
    Ready,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelStateKind,
    pub active: usize,
    pub source: Option<ModelSource>,
    pub loads: u64,
    pub evictions: u64,
    pub idle_timeout_secs: u64,
}

enum Slot {
    Unloaded,
    Loading,
    Ready(Arc<dyn SpeechModel>),
}

impl Slot {
    fn kind(&self) -> ModelStateKind {
        match self {
            Slot::Unloaded => ModelStateKind::Unloaded,
            Slot::Loading => ModelStateKind::Loading,
            Slot::Ready(_) => ModelStateKind::Ready,
        }
    }
}

struct Inner {
    slot: Slot,
    /// Outstanding leases
    active: usize,
    last_release: Instant,
    source: Option<ModelSource>,
    loads: u64,
    evictions: u64,
}

/// Wake-ups for the reaper task, kept outside the manager so the reaper can
/// wait on them without keeping the manager alive.
#[derive(Default)]
struct ReaperSignals {
    released: Notify,
    stop: Notify,
}

/// Background load. Installs its own result before finishing.
type LoadTask = JoinHandle<Result<(), JobError>>;

pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    idle_timeout: Duration,
    inner: Mutex<Inner>,
    /// Serializes loading and eviction. Holds the load in flight, if any.
    load_gate: tokio::sync::Mutex<Option<LoadTask>>,
    signals: Arc<ReaperSignals>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ModelManager {
    /// Create the manager and spawn its eviction task. Must be called from
    /// within a tokio runtime.
    pub fn new(loader: Arc<dyn ModelLoader>, idle_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            loader,
            idle_timeout,
            inner: Mutex::new(Inner {
                slot: Slot::Unloaded,
                active: 0,
                last_release: Instant::now(),
                source: None,
                loads: 0,
                evictions: 0,
            }),
            load_gate: tokio::sync::Mutex::new(None),
            signals: Arc::new(ReaperSignals::default()),
            reaper: Mutex::new(None),
        });

        let handle = tokio::spawn(reap(Arc::downgrade(&manager), manager.signals.clone()));
        *lock(&manager.reaper) = Some(handle);
        manager
    }

    /// Get a lease on the model, loading it first if necessary.
    ///
    /// Dropping the returned future while the model loads leaves the load
    /// running; its result is installed anyway and the next caller picks it up.
    pub async fn acquire(self: &Arc<Self>) -> Result<ModelLease, JobError> {
        let mut gate = self.load_gate.lock().await;

        if let Some(lease) = self.lease_if_ready() {
            return Ok(lease);
        }

        if gate.is_some() {
            debug!("Joining a model load already in flight");
        }
        let task = gate.get_or_insert_with(|| {
            lock(&self.inner).slot = Slot::Loading;
            info!("Loading speech model");
            self.spawn_load()
        });

        let finished = task.await;
        *gate = None;
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                lock(&self.inner).slot = Slot::Unloaded;
                error!(error = %e, "Model load task failed");
                return Err(JobError::ModelLoad(format!("load task failed: {}", e)));
            }
        }

        // The gate is still held, so the reaper cannot evict in between.
        self.lease_if_ready()
            .ok_or_else(|| JobError::ModelLoad("model missing after load".to_string()))
    }

    fn lease_if_ready(self: &Arc<Self>) -> Option<ModelLease> {
        let mut inner = lock(&self.inner);
        let model = match &inner.slot {
            Slot::Ready(model) => model.clone(),
            _ => return None,
        };
        inner.active += 1;
        debug!(active = inner.active, "Model lease granted");
        Some(self.lease(model))
    }

    fn spawn_load(self: &Arc<Self>) -> LoadTask {
        let manager = self.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = manager.loader.load().await;
            manager.install(result, started.elapsed())
        })
    }

    /// Record the outcome of a load. The idle window starts now, so a model
    /// nobody waited for is still evicted eventually.
    fn install(&self, result: anyhow::Result<LoadedModel>, took: Duration) -> Result<(), JobError> {
        let mut inner = lock(&self.inner);
        match result {
            Ok(loaded) => {
                inner.slot = Slot::Ready(loaded.model);
                inner.source = Some(loaded.source);
                inner.loads += 1;
                inner.last_release = Instant::now();
                drop(inner);
                self.signals.released.notify_one();
                info!(source = ?loaded.source, load_secs = took.as_secs_f64(), "Speech model ready");
                Ok(())
            }
            Err(e) => {
                inner.slot = Slot::Unloaded;
                error!(error = %format!("{:#}", e), "Speech model failed to load");
                Err(JobError::ModelLoad(format!("{:#}", e)))
            }
        }
    }

    pub fn state(&self) -> ModelStatus {
        let inner = lock(&self.inner);
        ModelStatus {
            state: inner.slot.kind(),
            active: inner.active,
            source: inner.source,
            loads: inner.loads,
            evictions: inner.evictions,
            idle_timeout_secs: self.idle_timeout.as_secs(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Stop the eviction task and drop the model if nobody is using it.
    ///
    /// A load that was abandoned by its caller is waited for first.
    pub async fn shutdown(&self) {
        self.signals.stop.notify_one();
        let handle = lock(&self.reaper).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut gate = self.load_gate.lock().await;
        if let Some(task) = gate.take() {
            debug!("Waiting for the model load in flight");
            if task.await.is_err() {
                lock(&self.inner).slot = Slot::Unloaded;
            }
        }

        let evicted = {
            let mut inner = lock(&self.inner);
            if inner.active == 0 && matches!(inner.slot, Slot::Ready(_)) {
                inner.evictions += 1;
                Some(std::mem::replace(&mut inner.slot, Slot::Unloaded))
            } else {
                None
            }
        };
        if evicted.is_some() {
            drop(evicted);
            info!("Speech model unloaded on shutdown");
        }
    }

    fn lease(self: &Arc<Self>, model: Arc<dyn SpeechModel>) -> ModelLease {
        ModelLease {
            model,
            manager: self.clone(),
            released: false,
        }
    }

    fn on_release(&self) {
        let mut inner = lock(&self.inner);
        debug_assert!(inner.active > 0, "lease released twice");
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 {
            inner.last_release = Instant::now();
            drop(inner);
            self.signals.released.notify_one();
        }
    }

    /// When the model becomes evictable, if it is idle right now.
    fn eviction_deadline(&self) -> Option<Instant> {
        let inner = lock(&self.inner);
        match inner.slot {
            Slot::Ready(_) if inner.active == 0 => Some(inner.last_release + self.idle_timeout),
            _ => None,
        }
    }

    /// Drop the model if it is still idle. Re-checks everything under the lock.
    ///
    /// Callers hold the load gate, so a new load cannot start until the old
    /// weights are gone.
    fn evict_if_idle(&self) -> bool {
        let evicted = {
            let mut inner = lock(&self.inner);
            let idle_for = inner.last_release.elapsed();
            if !matches!(inner.slot, Slot::Ready(_))
                || inner.active > 0
                || idle_for < self.idle_timeout
            {
                return false;
            }
            inner.evictions += 1;
            std::mem::replace(&mut inner.slot, Slot::Unloaded)
        };

        // Freeing the weights can take a moment; only the gate is still held.
        drop(evicted);
        info!(idle_secs = self.idle_timeout.as_secs(), "Speech model unloaded after idle timeout");
        true
    }
}

/// Single eviction task. Sleeps until the current idle deadline, then asks the
/// manager to evict; any release in the meantime restarts the wait.
async fn reap(manager: Weak<ModelManager>, signals: Arc<ReaperSignals>) {
    loop {
        let deadline = match manager.upgrade() {
            Some(manager) => manager.eviction_deadline(),
            None => break,
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        match manager.upgrade() {
                            Some(manager) => {
                                let _gate = manager.load_gate.lock().await;
                                manager.evict_if_idle();
                            }
                            None => break,
                        }
                    }
                    _ = signals.released.notified() => {}
                    _ = signals.stop.notified() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = signals.released.notified() => {}
                    _ = signals.stop.notified() => break,
                }
            }
        }
    }
    debug!("Model reaper stopped");
}

/// Proof that the holder is counted as an active user of the model.
///
/// Release happens exactly once, either through [`ModelLease::release`] or on
/// drop. Cloning takes out an additional counted lease.
pub struct ModelLease {
    model: Arc<dyn SpeechModel>,
    manager: Arc<ModelManager>,
    released: bool,
}

impl ModelLease {
    pub fn model(&self) -> &Arc<dyn SpeechModel> {
        &self.model
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.on_release();
        }
    }
}

impl Clone for ModelLease {
    fn clone(&self) -> Self {
        lock(&self.manager.inner).active += 1;
        Self {
            model: self.model.clone(),
            manager: self.manager.clone(),
            released: false,
        }
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("released", &self.released)
            .finish()
    }
}

/// Lock ignoring poisoning; the guarded state stays consistent because every
/// critical section is a handful of field assignments.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLoader, FakeModel};
    use tokio::time::sleep;

    const IDLE: Duration = Duration::from_secs(600);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_load_and_reuse() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]));
        let manager = ModelManager::new(loader.clone(), IDLE);
        assert_eq!(manager.state().state, ModelStateKind::Unloaded);

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert!(Arc::ptr_eq(first.model(), second.model()));
        assert_eq!(loader.loads(), 1);

        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Ready);
        assert_eq!(status.active, 2);
        assert_eq!(status.source, Some(ModelSource::LocalDir));

        first.release();
        drop(second);
        assert_eq!(manager.state().active, 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_loads_once() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]))
            .with_delay(Duration::from_secs(5));
        let manager = ModelManager::new(loader.clone(), IDLE);

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.map(|lease| lease.model().clone()) }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.map(|lease| lease.model().clone()) }
        });

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.loads(), 1);
        assert_eq!(manager.state().active, 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_happens_once() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]));
        let manager = ModelManager::new(loader.clone(), IDLE);

        manager.acquire().await.unwrap().release();
        sleep(Duration::from_secs(601)).await;
        settle().await;

        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Unloaded);
        assert_eq!(status.evictions, 1);

        sleep(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(manager.state().evictions, 1);

        // Next acquisition reloads
        manager.acquire().await.unwrap().release();
        assert_eq!(loader.loads(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eviction_while_leased() {
        let manager = ModelManager::new(FakeLoader::new(FakeModel::with_segments(vec![])), IDLE);

        let lease = manager.acquire().await.unwrap();
        sleep(Duration::from_secs(3 * 600)).await;
        settle().await;
        assert_eq!(manager.state().state, ModelStateKind::Ready);

        // Idle window starts at release, not at acquisition
        drop(lease);
        sleep(Duration::from_secs(599)).await;
        settle().await;
        assert_eq!(manager.state().state, ModelStateKind::Ready);

        sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(manager.state().state, ModelStateKind::Unloaded);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_before_deadline_postpones_eviction() {
        // Job finishes at t=0, next job arrives at t=599 and runs briefly.
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]));
        let manager = ModelManager::new(loader.clone(), IDLE);

        manager.acquire().await.unwrap().release();
        sleep(Duration::from_secs(599)).await;
        settle().await;

        let lease = manager.acquire().await.unwrap();
        sleep(Duration::from_secs(1)).await;
        lease.release();

        // t=602: the original deadline (t=600) has passed, but the model was used
        sleep(Duration::from_secs(2)).await;
        settle().await;
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Ready);
        assert_eq!(status.evictions, 0);
        assert_eq!(loader.loads(), 1);

        // t=1201: 601 s after the last release
        sleep(Duration::from_secs(599)).await;
        settle().await;
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Unloaded);
        assert_eq!(status.evictions, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_leaves_unloaded_and_retries() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![])).failing_first(1);
        let manager = ModelManager::new(loader.clone(), IDLE);

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, JobError::ModelLoad(_)));
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Unloaded);
        assert_eq!(status.active, 0);

        let lease = manager.acquire().await.unwrap();
        assert_eq!(manager.state().state, ModelStateKind::Ready);
        assert_eq!(loader.attempts(), 2);
        drop(lease);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_load_is_joined_not_restarted() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]))
            .with_delay(Duration::from_secs(60));
        let manager = ModelManager::new(loader.clone(), IDLE);

        let gave_up = tokio::time::timeout(Duration::from_secs(1), manager.acquire()).await;
        assert!(gave_up.is_err());
        assert_eq!(manager.state().state, ModelStateKind::Loading);

        let lease = manager.acquire().await.unwrap();
        assert_eq!(loader.attempts(), 1);
        assert_eq!(loader.loads(), 1);
        assert_eq!(loader.peak_concurrent_loads(), 1);
        assert_eq!(manager.state().active, 1);

        drop(lease);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_load_completes_and_idles_out() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]))
            .with_delay(Duration::from_secs(60));
        let manager = ModelManager::new(loader.clone(), IDLE);

        let gave_up = tokio::time::timeout(Duration::from_secs(1), manager.acquire()).await;
        assert!(gave_up.is_err());

        sleep(Duration::from_secs(60)).await;
        settle().await;
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Ready);
        assert_eq!(status.active, 0);

        // Idle window counts from the end of the load
        sleep(Duration::from_secs(601)).await;
        settle().await;
        assert_eq!(manager.state().state, ModelStateKind::Unloaded);
        assert_eq!(loader.loads(), 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_abandoned_load() {
        let loader = FakeLoader::new(FakeModel::with_segments(vec![]))
            .with_delay(Duration::from_secs(60));
        let manager = ModelManager::new(loader.clone(), IDLE);

        let gave_up = tokio::time::timeout(Duration::from_secs(1), manager.acquire()).await;
        assert!(gave_up.is_err());

        manager.shutdown().await;
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Unloaded);
        assert_eq!(status.loads, 1);
        assert_eq!(status.evictions, 1);
    }

    /// Counts models alive at once. Dropping one takes a few milliseconds,
    /// like freeing real weights.
    #[derive(Default)]
    struct ResidentCounter {
        resident: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    struct TrackedModel(Arc<ResidentCounter>);

    impl SpeechModel for TrackedModel {
        fn transcribe(
            &self,
            _pcm: &[f32],
            _opts: &crate::transcription::DecodeOptions,
        ) -> anyhow::Result<Vec<crate::transcription::TranscriptSegment>> {
            Ok(Vec::new())
        }
    }

    impl Drop for TrackedModel {
        fn drop(&mut self) {
            std::thread::sleep(Duration::from_millis(5));
            self.0.resident.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct TrackingLoader(Arc<ResidentCounter>);

    #[async_trait]
    impl ModelLoader for TrackingLoader {
        async fn load(&self) -> anyhow::Result<LoadedModel> {
            use std::sync::atomic::Ordering;
            let now = self.0.resident.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            Ok(LoadedModel {
                model: Arc::new(TrackedModel(self.0.clone())),
                source: ModelSource::LocalDir,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eviction_and_reload_never_overlap() {
        let counter = Arc::new(ResidentCounter::default());
        let manager = ModelManager::new(
            Arc::new(TrackingLoader(counter.clone())),
            Duration::from_millis(20),
        );

        // Each acquire lands right around the previous eviction deadline
        for round in 0..20u64 {
            manager.acquire().await.unwrap().release();
            sleep(Duration::from_millis(18 + round % 5)).await;
        }
        manager.shutdown().await;

        let status = manager.state();
        assert_eq!(counter.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(status.loads, status.evictions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloned_lease_is_counted() {
        let manager = ModelManager::new(FakeLoader::new(FakeModel::with_segments(vec![])), IDLE);

        let lease = manager.acquire().await.unwrap();
        let inflight = lease.clone();
        assert_eq!(manager.state().active, 2);

        drop(lease);
        sleep(Duration::from_secs(700)).await;
        settle().await;
        assert_eq!(manager.state().state, ModelStateKind::Ready);

        drop(inflight);
        assert_eq!(manager.state().active, 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unloads_idle_model() {
        let manager = ModelManager::new(FakeLoader::new(FakeModel::with_segments(vec![])), IDLE);
        manager.acquire().await.unwrap().release();

        manager.shutdown().await;
        let status = manager.state();
        assert_eq!(status.state, ModelStateKind::Unloaded);
        assert_eq!(status.evictions, 1);
    }
}
