//! # voice-transcriber server
//!
//! Wires the pipeline together and serves the HTTP transport:
//! 1. Load `.env`, initialize tracing, load and validate configuration
//! 2. Create working directories, log the selected compute device
//! 3. Build the model manager, the job queue and its single worker
//! 4. Run the HTTP server until SIGINT/SIGTERM
//! 5. Shut down in order: stop HTTP, close the queue, let the worker finish
//!    its current job and discard the rest, unload the model

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_transcriber::config::AppConfig;
use voice_transcriber::device::{DeviceManager, DevicePreference, Precision};
use voice_transcriber::mailbox::Mailbox;
use voice_transcriber::queue::{JobQueue, Worker};
use voice_transcriber::state::AppState;
use voice_transcriber::transcription::{ModelManager, ModelResolver, WhisperLoader};
use voice_transcriber::{handlers, health};

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    create_directories(&config)?;

    let device_preference: DevicePreference =
        config.models.device.parse().map_err(anyhow::Error::msg)?;
    let precision: Precision = config.models.precision.parse().map_err(anyhow::Error::msg)?;
    let device = DeviceManager::get_device_summary(device_preference);
    info!(
        device = %device.current_device,
        cuda = device.cuda_available,
        metal = device.metal_available,
        precision = ?precision,
        "Compute device selected"
    );

    let resolver = ModelResolver::new(config.models.repo.clone(), config.models.model_dir.clone());
    let loader = Arc::new(WhisperLoader::new(resolver, device_preference, precision));
    let models = ModelManager::new(loader, config.idle_eviction());
    info!(
        repo = %config.models.repo,
        idle_eviction_secs = config.queue.idle_eviction_secs,
        "Model will be loaded on first job"
    );

    let mailbox = Arc::new(Mailbox::new());
    let (queue, receiver) = JobQueue::new();
    let worker = Worker::new(receiver, &config, models.clone(), mailbox.clone());
    let worker_task = tokio::spawn(worker.run());

    let app_state = AppState::new(config.clone(), queue.clone(), models.clone(), mailbox, device);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/status", web::get().to(health::status))
                    .route("/jobs", web::post().to(handlers::submit_job))
                    .route("/jobs/{job_id}/messages", web::get().to(handlers::get_messages)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    queue.close();
    info!("Waiting for the worker to finish its current job");
    if let Err(e) = worker_task.await {
        error!("Worker task error: {}", e);
    }
    models.shutdown().await;

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_transcriber=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn create_directories(config: &AppConfig) -> Result<()> {
    for dir in [&config.server.upload_dir, &config.audio.normalized_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to Ctrl-C: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
