//! # Transcription Module
//!
//! Speech-to-text with Whisper via the candle framework, plus the machinery
//! that keeps the (large) model in memory only while it is needed.
//!
//! ## Key Components:
//! - **Lifecycle** (`lifecycle`): lazy loading, counted leases, idle eviction
//! - **Source** (`source`): local directory, Hugging Face cache or download
//! - **Model** (`model`): candle Whisper implementation of [`SpeechModel`]
//! - **Engine** (`engine`): runs a leased model over a normalized WAV file

pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod source;

pub use engine::{join_segments, DecodeOptions, SpeechModel, TranscriptSegment, TranscriptionEngine};
pub use lifecycle::{LoadedModel, ModelLease, ModelLoader, ModelManager, ModelStateKind, ModelStatus};
pub use model::{WhisperLoader, WhisperModel};
pub use source::{ModelFiles, ModelResolver, ModelSource};
