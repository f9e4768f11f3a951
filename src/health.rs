//! # Health and Status Endpoints
//!
//! - `GET /health`: liveness plus a compact view of the pipeline
//! - `GET /api/v1/status`: queue, model lifecycle, device and process memory
//!
//! Both are read-only and never touch the model, so polling them does not
//! keep an idle model alive.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Basic health check.
///
/// Reports `"degraded"` once the queue has stopped accepting jobs (shutdown in
/// progress); the HTTP status stays 200 so load balancers can drain gracefully.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let queue = state.queue.snapshot();
    let model = state.models.state();

    HttpResponse::Ok().json(json!({
        "status": if queue.accepting { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "queue": {
            "pending": queue.pending,
            "busy": queue.busy_job.is_some(),
        },
        "model": {
            "state": model.state,
            "active": model.active,
        }
    }))
}

/// Detailed pipeline status.
///
/// ## Response:
/// ```json
/// {
///   "queue": { "pending": 2, "busy_job": "5f0c...", "accepting": true },
///   "model": { "state": "ready", "active": 1, "source": "hub_cache", "loads": 1, "evictions": 0, "idle_timeout_secs": 600 },
///   "device": { "cuda_available": false, "metal_available": false, "gpu_available": false, "current_device": "CPU" },
///   "memory": { "resident_memory_bytes": 3123456789, "available": true }
/// }
/// ```
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "queue": state.queue.snapshot(),
        "model": state.models.state(),
        "device": state.device,
        "settings": {
            "repo": config.models.repo,
            "language": config.models.language,
            "beam_size": config.models.beam_size,
            "precision": config.models.precision,
            "chunk_size": config.queue.chunk_size,
            "job_timeout_secs": config.queue.job_timeout_secs,
        },
        "memory": get_memory_info(),
    }))
}

/// Resident and virtual memory of this process, read from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::DeviceSummary;
    use crate::mailbox::Mailbox;
    use crate::queue::JobQueue;
    use crate::testing::{FakeLoader, FakeModel};
    use crate::transcription::ModelManager;
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn app_state() -> AppState {
        let (queue, _receiver) = JobQueue::new();
        let models = ModelManager::new(FakeLoader::new(FakeModel::with_text("x")), Duration::from_secs(600));
        let device = DeviceSummary {
            cuda_available: false,
            metal_available: false,
            gpu_available: false,
            current_device: "CPU".to_string(),
        };
        AppState::new(AppConfig::default(), queue, models, Arc::new(Mailbox::new()), device)
    }

    #[actix_web::test]
    async fn test_health_reports_idle_pipeline() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let resp: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp["status"], "healthy");
        assert_eq!(resp["queue"]["pending"], 0);
        assert_eq!(resp["model"]["state"], "unloaded");
    }

    #[actix_web::test]
    async fn test_status_reflects_closed_queue() {
        let state = app_state();
        state.queue.close();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/status", web::get().to(status)),
        )
        .await;

        let resp: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/status").to_request())
                .await;
        assert_eq!(resp["queue"]["accepting"], false);
        assert_eq!(resp["model"]["loads"], 0);
        assert_eq!(resp["device"]["current_device"], "CPU");
    }
}
