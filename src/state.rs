//! # Application State
//!
//! Everything the HTTP handlers share. Each field is already cheap to clone
//! (`Arc` or a handle type), so `AppState` itself is cloned into every actix
//! worker thread by `web::Data`.

use crate::config::AppConfig;
use crate::device::DeviceSummary;
use crate::intake::Intake;
use crate::mailbox::Mailbox;
use crate::queue::JobQueue;
use crate::transcription::ModelManager;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub queue: JobQueue,
    pub models: Arc<ModelManager>,
    pub mailbox: Arc<Mailbox>,
    pub intake: Intake,
    /// Device selected at startup, reported by the status endpoints
    pub device: DeviceSummary,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        queue: JobQueue,
        models: Arc<ModelManager>,
        mailbox: Arc<Mailbox>,
        device: DeviceSummary,
    ) -> Self {
        let intake = Intake::new(queue.clone(), mailbox.clone());
        Self {
            config: Arc::new(config),
            queue,
            models,
            mailbox,
            intake,
            device,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
