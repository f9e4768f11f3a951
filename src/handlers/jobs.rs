//! # Job Submission REST API Handlers
//!
//! HTTP transport for the transcription queue. Uploads are stored under
//! `server.upload_dir` and handed to [`Intake`](crate::intake::Intake); results
//! are collected from the in-memory mailbox, keyed by job id.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/jobs` - Upload a media file for transcription
//! - `GET /api/v1/jobs/{job_id}/messages` - Messages delivered for a job so far

use crate::audio::format::{extension_of, MediaKind, VIDEO_EXTENSIONS};
use crate::cleanup;
use crate::error::{AppError, AppResult};
use crate::queue::JobId;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Uploads larger than this are rejected while streaming.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    /// Jobs ahead of this one at submission time
    pub position: usize,
    pub messages_url: String,
}

/// Upload a media file for transcription.
///
/// ## Endpoint: `POST /api/v1/jobs`
///
/// ## Request:
/// Multipart form data:
/// - `file` (required): the audio or video file
/// - `kind` (optional): `audio`, `voice`, `video` or `video_note`; inferred
///   from the file extension when absent
///
/// ## Response (`202 Accepted`):
/// ```json
/// {
///   "job_id": "5f0c2a8e-...",
///   "position": 2,
///   "messages_url": "/api/v1/jobs/5f0c2a8e-.../messages"
/// }
/// ```
pub async fn submit_job(state: web::Data<AppState>, mut payload: Multipart) -> AppResult<HttpResponse> {
    let job_id = JobId::generate();
    let mut form = UploadForm::default();

    if let Err(e) = read_form(&mut payload, &state.config.server.upload_dir, &job_id, &mut form).await {
        if let Some(path) = &form.path {
            cleanup::remove_best_effort(path).await;
        }
        return Err(e);
    }

    let path = form
        .path
        .ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    let kind = form
        .kind
        .unwrap_or_else(|| infer_kind(form.extension.as_deref()));

    let submission = state
        .intake
        .submit(job_id.as_str(), path, kind, Some(job_id.clone()))
        .await?;
    state.mailbox.open(submission.job_id.as_str());

    info!(job_id = %submission.job_id, position = submission.position, "Upload queued");

    Ok(HttpResponse::Accepted().json(SubmitResponse {
        messages_url: format!("/api/v1/jobs/{}/messages", submission.job_id),
        job_id: submission.job_id,
        position: submission.position,
    }))
}

/// What the multipart form carried. `path` is set as soon as a file lands on disk.
#[derive(Debug, Default)]
struct UploadForm {
    path: Option<PathBuf>,
    extension: Option<String>,
    kind: Option<MediaKind>,
}

async fn read_form(
    payload: &mut Multipart,
    upload_dir: &Path,
    job_id: &JobId,
    form: &mut UploadForm,
) -> AppResult<()> {
    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();
        let extension = content_disposition
            .get_filename()
            .and_then(|name| extension_of(Path::new(name)))
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()));

        match field_name.as_str() {
            "file" if form.path.is_some() => {
                return Err(AppError::BadRequest("Only one file per job is accepted".to_string()));
            }
            "file" => {
                let path = upload_path(upload_dir, job_id, extension.as_deref());
                form.path = Some(path.clone());
                form.extension = extension;
                save_field(&mut field, &path).await?;
            }
            "kind" => {
                let text = read_text(&mut field).await?;
                let kind = text.trim().parse::<MediaKind>().map_err(AppError::ValidationError)?;
                form.kind = Some(kind);
            }
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }
    Ok(())
}

/// Messages delivered for a job so far.
///
/// ## Endpoint: `GET /api/v1/jobs/{job_id}/messages`
///
/// ## Response:
/// ```json
/// {
///   "job_id": "5f0c2a8e-...",
///   "messages": [
///     { "text": "Processing time: 12.40 s", "sent_at": "2025-01-01T12:00:00Z" },
///     { "text": "...", "sent_at": "2025-01-01T12:00:00Z" }
///   ]
/// }
/// ```
pub async fn get_messages(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let job_id = path.into_inner();
    let messages = state
        .mailbox
        .messages(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Unknown job: {}", job_id)))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "job_id": job_id,
        "messages": messages,
    })))
}

/// `<upload_dir>/<job_id>[.ext]`
fn upload_path(upload_dir: &Path, job_id: &JobId, extension: Option<&str>) -> PathBuf {
    match extension {
        Some(ext) => upload_dir.join(format!("{}.{}", job_id, ext)),
        None => upload_dir.join(job_id.as_str()),
    }
}

fn infer_kind(extension: Option<&str>) -> MediaKind {
    match extension {
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext) => MediaKind::Video,
        _ => MediaKind::Audio,
    }
}

async fn save_field(field: &mut Field, path: &Path) -> AppResult<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;

    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        written += chunk.len();
        if written > MAX_UPLOAD_BYTES {
            return Err(AppError::ValidationError(format!(
                "File too large (max: {} bytes)",
                MAX_UPLOAD_BYTES
            )));
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    debug!(path = %path.display(), bytes = written, "Upload stored");
    Ok(())
}

async fn read_text(field: &mut Field) -> AppResult<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() > 64 {
            return Err(AppError::ValidationError("Field value too long".to_string()));
        }
    }
    String::from_utf8(bytes).map_err(|_| AppError::ValidationError("Field is not UTF-8".to_string()))
}
