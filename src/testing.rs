//! In-memory stand-ins for the model, its loader and the transport, shared by
//! the unit tests of several modules.

use crate::delivery::Delivery;
use crate::error::DeliveryError;
use crate::transcription::engine::{DecodeOptions, SpeechModel, TranscriptSegment};
use crate::transcription::lifecycle::{LoadedModel, ModelLoader};
use crate::transcription::source::ModelSource;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeModelInner {
    segments: Vec<TranscriptSegment>,
    failure: Option<String>,
    delay: Option<Duration>,
    seen: Mutex<Vec<usize>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Returns canned segments and remembers the length of every input, along
/// with how many calls ever overlapped.
#[derive(Clone)]
pub struct FakeModel {
    inner: Arc<FakeModelInner>,
}

impl FakeModel {
    fn build(segments: Vec<TranscriptSegment>, failure: Option<String>, delay: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(FakeModelInner {
                segments,
                failure,
                delay,
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_segments(segments: Vec<TranscriptSegment>) -> Self {
        Self::build(segments, None, None)
    }

    pub fn with_text(text: &str) -> Self {
        Self::with_segments(vec![TranscriptSegment::new(text, 0.0, 1.0)])
    }

    pub fn failing(message: &str) -> Self {
        Self::build(Vec::new(), Some(message.to_string()), None)
    }

    /// Blocks the inference thread for `delay` before answering.
    pub fn slow(text: &str, delay: Duration) -> Self {
        Self::build(vec![TranscriptSegment::new(text, 0.0, 1.0)], None, Some(delay))
    }

    pub fn seen_samples(&self) -> Vec<usize> {
        self.inner.seen.lock().unwrap().clone()
    }

    /// Number of `transcribe` calls that have started.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `transcribe` calls ever running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl SpeechModel for FakeModel {
    fn transcribe(&self, pcm: &[f32], _opts: &DecodeOptions) -> anyhow::Result<Vec<TranscriptSegment>> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.inner.delay {
            std::thread::sleep(delay);
        }
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.seen.lock().unwrap().push(pcm.len());
        match &self.inner.failure {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(self.inner.segments.clone()),
        }
    }
}

/// Hands out a fresh `Arc` of the same fake model on every load.
pub struct FakeLoader {
    model: FakeModel,
    attempts: AtomicUsize,
    loads: AtomicUsize,
    fail_first: AtomicUsize,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeLoader {
    pub fn new(model: FakeModel) -> Arc<Self> {
        Arc::new(Self {
            model,
            attempts: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Fails the first `n` load attempts.
    pub fn failing_first(self: Arc<Self>, n: usize) -> Arc<Self> {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Each load sleeps on the tokio clock for `delay`.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of loads ever running at once.
    pub fn peak_concurrent_loads(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self) -> anyhow::Result<LoadedModel> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if attempt < self.fail_first.load(Ordering::SeqCst) {
            anyhow::bail!("weights not reachable");
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedModel {
            model: Arc::new(self.model.clone()),
            source: ModelSource::LocalDir,
        })
    }
}

/// Records every delivered message; can be told to fail.
#[derive(Default)]
pub struct RecordingDelivery {
    messages: Mutex<Vec<(String, String)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let delivery = Self::default();
        delivery.fail.store(true, Ordering::SeqCst);
        Arc::new(delivery)
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn texts_for(&self, reply_to: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(to, _)| to == reply_to)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn send(&self, reply_to: &str, text: &str) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError("transport unavailable".to_string()));
        }
        self.messages
            .lock()
            .unwrap()
            .push((reply_to.to_string(), text.to_string()));
        Ok(())
    }
}
