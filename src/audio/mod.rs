//! # Audio Processing Module
//!
//! Everything between "a user uploaded a media file" and "a canonical WAV is
//! ready for the speech model".
//!
//! ## Key Components:
//! - **Format classification** (`format`): accepted extensions, demux decision
//! - **Demuxer** (`demux`): ffmpeg-based audio track extraction
//! - **Normalizer** (`normalizer`): decode, resample, normalize, pad, write
//!
//! ## Output Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)

pub mod demux;
pub mod format;
pub mod normalizer;

pub use demux::Demuxer;
pub use format::MediaKind;
pub use normalizer::{AudioNormalizer, TARGET_SAMPLE_RATE};
