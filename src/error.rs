//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Job errors** (`JobError`, `IntakeError`, `DeliveryError`): the failure taxonomy
//!   of the transcription pipeline. Every per-job failure is caught at the worker
//!   boundary and turned into one user-visible message; none of them stop the worker.
//! - **HTTP errors** (`AppError`): what the thin HTTP front door returns to clients,
//!   converted to JSON responses through actix's `ResponseError` trait.
//!
//! ## Propagation Policy:
//! - `JobError` → reported to the submitter, logged, worker continues
//! - `DeliveryError` → logged only, never retried
//! - `IntakeError` → returned to the caller before anything is enqueued
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> and `?`
//! - Every pipeline stage returns `Result<_, JobError>`
//! - `?` returns early with the error, converting it through `From` on the way
//! - The worker is the one place that matches on the error instead of propagating it
//!
//! ### thiserror
//! - `#[derive(thiserror::Error)]` writes the `Display` and `Error` impls
//! - `#[error("...")]` is the display text; `{0}` refers to the first field
//! - `#[from]` generates `From<std::io::Error> for JobError`, so `?` works on I/O calls
//!
//! ### anyhow at the edges
//! - Startup code and the model loader return `anyhow::Result` and attach context
//! - Anyhow errors become `JobError::ModelLoad` or `AppError::Internal` at the boundary
//!
//! ### ResponseError
//! - actix calls `status_code` and `error_response` when a handler returns `Err(AppError)`

use actix_web::{HttpResponse, ResponseError};  // HTTP error conversion
use serde_json::json;                          // JSON error bodies
use std::fmt;                                  // Display for AppError
use std::path::PathBuf;
use std::time::Duration;

/// Failures that can end a single transcription job.
///
/// ## Variants map to pipeline stages:
/// - **FileNotFound**: source vanished before normalization
/// - **Decode**: unsupported codec or corrupt audio
/// - **Demux**: audio track extraction from a video container failed
/// - **ModelLoad**: both local and remote model sourcing failed
/// - **Transcription**: the inference engine raised an error
/// - **Timeout**: the optional per-job watchdog expired
/// - **Io**: filesystem failure while moving files between stages
///
/// ## Rust Concepts:
/// - **Data-carrying variants**: `FileNotFound` holds the path, `Timeout` the limit
/// - **`#[from]`**: lets `?` turn a `std::io::Error` into `JobError::Io`
/// - **`Display` vs `user_message`**: the derived `Display` text is for logs, while
///   `user_message` is the wording the submitter sees
///
/// ## Usage Example:
/// ```
/// use std::time::Duration;
/// use voice_transcriber::error::JobError;
///
/// let err = JobError::Timeout(Duration::from_secs(90));
/// assert_eq!(err.kind(), "timeout");
/// assert_eq!(err.to_string(), "job exceeded the 90s watchdog");
/// assert!(err.user_message().contains("90 seconds"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("source file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("audio decoding failed: {0}")]
    Decode(String),

    #[error("audio extraction from video failed: {0}")]
    Demux(String),

    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("job exceeded the {}s watchdog", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Short explanation sent back to the submitter.
    ///
    /// Internal details (paths, stderr excerpts) stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            JobError::FileNotFound(_) => {
                "The uploaded file could not be found. Please send it again.".to_string()
            }
            JobError::Decode(_) => {
                "The audio could not be decoded. The file may be corrupt or use an unsupported codec."
                    .to_string()
            }
            JobError::Demux(_) => "Could not extract the audio track from the video.".to_string(),
            JobError::ModelLoad(_) => {
                "The speech recognition model is unavailable right now. Please try again later."
                    .to_string()
            }
            JobError::Transcription(_) => "Speech recognition failed for this file.".to_string(),
            JobError::Timeout(limit) => format!(
                "Processing took longer than {} seconds and was aborted.",
                limit.as_secs()
            ),
            JobError::Io(_) => "An internal error occurred while processing the file.".to_string(),
        }
    }

    /// Machine-readable tag used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::FileNotFound(_) => "file_not_found",
            JobError::Decode(_) => "decode_error",
            JobError::Demux(_) => "demux_error",
            JobError::ModelLoad(_) => "model_load_error",
            JobError::Transcription(_) => "transcription_error",
            JobError::Timeout(_) => "timeout",
            JobError::Io(_) => "io_error",
        }
    }
}

/// Rejections raised by the front door before a job reaches the queue.
///
/// Returned before the upload is enqueued, so the queue size never changes
/// when one of these comes back.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("the queue is shut down and no longer accepts jobs")]
    QueueClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sending a message back through the transport failed.
///
/// ## Rust Concepts:
/// - **Tuple struct**: one unnamed `String` field, read as `err.0`
/// - **`#[error]` on a struct**: thiserror works on structs as well as enums
#[derive(Debug, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Errors returned by the HTTP front door.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: client sent invalid data (400)
/// - **NotFound**: unknown job id (404)
/// - **ConfigError**: configuration problems (500)
/// - **ValidationError**: upload failed validation (400)
/// - **Unavailable**: the queue is shutting down (503)
///
/// ## Rust Concepts:
/// - **Hand-written `Display`**: unlike `JobError`, this one implements the
///   trait itself, prefixing every message with its category
/// - **`impl ResponseError`**: lets handlers return `Result<HttpResponse, AppError>`
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::NotFound(format!("unknown job {}", job_id)));
/// ```
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "unsupported file format: .avi",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Anything unexpected from startup or helper code is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Intake rejections become client errors; I/O trouble while storing the upload is ours.
impl From<IntakeError> for AppError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::UnsupportedFormat(_) => AppError::ValidationError(err.to_string()),
            IntakeError::QueueClosed => AppError::Unavailable(err.to_string()),
            IntakeError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>` used by HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;
