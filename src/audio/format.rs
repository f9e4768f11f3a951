//! # Media Format Classification
//!
//! Decides, before anything is enqueued, whether a submitted file can be
//! processed and whether its audio must first be extracted from a video
//! container.
//!
//! ## Supported Inputs:
//! - **Audio**: `.ogg`, `.oga`, `.mp3`, `.wav`, `.m4a`, `.flac`
//! - **Video containers**: `.mp4`, `.mov`, `.mkv`
//! - **No extension**: accepted; the container is sniffed from the content later

use crate::error::IntakeError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const AUDIO_EXTENSIONS: &[&str] = &["ogg", "oga", "mp3", "wav", "m4a", "flac"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv"];

/// File-type hint declared by the transport (or sniffed by it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Voice,
    Video,
    VideoNote,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::VideoNote)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
            MediaKind::VideoNote => "video_note",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(MediaKind::Audio),
            "voice" => Ok(MediaKind::Voice),
            "video" => Ok(MediaKind::Video),
            "video_note" | "videonote" => Ok(MediaKind::VideoNote),
            _ => Err(format!("Unknown media kind: {}", s)),
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cased extension of `path`, if it has one.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Check that `path` is something the pipeline accepts and report whether it
/// needs demuxing.
///
/// ## Returns:
/// - **Ok(true)**: video container, audio must be extracted first
/// - **Ok(false)**: goes straight to the normalizer
/// - **Err(UnsupportedFormat)**: rejected before enqueue
pub fn requires_demux(path: &Path, kind: MediaKind) -> Result<bool, IntakeError> {
    match extension_of(path) {
        None => Ok(kind.is_video()),
        Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => Ok(false),
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => Ok(true),
        Some(ext) => Err(IntakeError::UnsupportedFormat(format!(".{}", ext))),
    }
}
