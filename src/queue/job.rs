//! Job records passed from the front door to the worker.

use crate::audio::format::MediaKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque job identifier (originating message id, or a generated UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for transports that don't supply one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work: a media file waiting to be transcribed.
///
/// The job owns `source_path`. Once the worker is done with it, successful or
/// not, the file is deleted.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Transport address the results go to (chat id, HTTP mailbox, ...)
    pub reply_to: String,
    pub source_path: PathBuf,
    pub kind: MediaKind,
    /// Whether the audio must be extracted from a video container first
    pub needs_demux: bool,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        reply_to: impl Into<String>,
        source_path: PathBuf,
        kind: MediaKind,
        needs_demux: bool,
    ) -> Self {
        Self {
            id,
            reply_to: reply_to.into(),
            source_path,
            kind,
            needs_demux,
            submitted_at: Utc::now(),
        }
    }
}
