//! # voice-transcriber
//!
//! Queue-based speech-to-text service. Media files arrive through a thin HTTP
//! transport, wait in a FIFO queue and are transcribed one at a time by a single
//! worker running Whisper on candle. The model is loaded on first use and
//! evicted after a configurable idle period.
//!
//! ## Pipeline:
//! intake → queue → worker (demux → normalize → lease model → transcribe →
//! chunk) → delivery, with every intermediate file removed afterwards.

pub mod audio;
pub mod chunker;
pub mod cleanup;
pub mod config;
pub mod delivery;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod intake;
pub mod mailbox;
pub mod queue;
pub mod state;
pub mod transcription;

#[cfg(test)]
mod testing;
