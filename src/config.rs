//! # Configuration Management
//!
//! Loads the service configuration from several sources, highest priority last:
//! 1. Default values (the `Default` impl below)
//! 2. `config.toml` in the working directory (optional)
//! 3. Environment variables prefixed with `APP_`, nested keys separated by `__`
//!    (e.g. `APP_QUEUE__IDLE_EVICTION_SECS=300`)
//! 4. `HOST` / `PORT`, used by most deployment platforms
//!
//! The core only consumes plain values from here: device, precision, model
//! directory, idle-eviction delay, padding threshold and chunk size.
//!
//! ## Key Rust Concepts Used:
//! - **Serde derives**: `Serialize` lets the defaults seed the `config` builder,
//!   `Deserialize` builds the typed struct back out of the merged sources
//! - **Nested structs**: each `[section]` of `config.toml` maps to one struct
//! - **`Option<T>` fields**: `#[serde(default)]` makes a missing key `None`
//! - **`Result<T>` from anyhow**: both loading and validation report errors with `?`
//!
//! ## Example `config.toml`:
//! ```toml
//! [models]
//! device = "cuda"
//! precision = "float16"
//!
//! [queue]
//! idle_eviction_secs = 300
//! job_timeout_secs = 900
//! ```

use anyhow::Result;                  // Error type with context for startup failures
use serde::{Deserialize, Serialize};  // Struct <-> TOML/env conversion
use std::env;                        // HOST / PORT overrides
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, grouped by concern.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**:
///   - `Debug`: printable with `{:?}` in startup logs
///   - `Clone`: the server clones it into `Arc<AppConfig>` for handlers
///   - `Serialize` / `Deserialize`: round-trips through the `config` crate
/// - **pub fields**: read directly (`config.queue.chunk_size`), no getters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub queue: QueueConfig,
}

/// HTTP front door settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where uploaded media is stored until the worker picks it up
    pub upload_dir: PathBuf,
}

/// Speech model settings.
///
/// ## Fields:
/// - `repo`: Hugging Face repository used when no local copy exists
/// - `model_dir`: local model directory, also used as the download cache
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
/// - `precision`: `float32`, `float16` or `bfloat16`
/// - `language`: fixed decoding language (ISO 639-1)
/// - `beam_size`: decoding beam width
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub repo: String,
    pub model_dir: PathBuf,
    pub device: String,
    pub precision: String,
    pub language: String,
    pub beam_size: usize,
    /// Upper bound on generated tokens per 30 second window
    pub max_tokens_per_window: usize,
}

/// Audio normalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub normalized_dir: PathBuf,
    /// Inputs shorter than this get trailing silence appended
    pub min_duration_ms: u64,
    pub pad_silence_ms: u64,
    pub ffmpeg_path: String,
}

/// Queue, worker and model lifecycle settings.
///
/// ## Fields:
/// - `idle_eviction_secs`: how long the model stays loaded after the last job
/// - `chunk_size`: maximum characters per delivered message, must be positive
/// - `job_timeout_secs`: optional watchdog for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub idle_eviction_secs: u64,
    pub chunk_size: usize,
    /// Per-job watchdog; unset means jobs may run indefinitely
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                upload_dir: PathBuf::from("audio_files/input"),
            },
            models: ModelsConfig {
                repo: "openai/whisper-large-v2".to_string(),
                model_dir: PathBuf::from("app/models/whisper-large-v2"),
                device: "auto".to_string(),
                precision: "float32".to_string(),
                language: "ru".to_string(),
                beam_size: 5,
                max_tokens_per_window: 224,
            },
            audio: AudioConfig {
                normalized_dir: PathBuf::from("audio_files/normalized"),
                min_duration_ms: 2000,
                pad_silence_ms: 3000,
                ffmpeg_path: "ffmpeg".to_string(),
            },
            queue: QueueConfig {
                idle_eviction_secs: 600,
                chunk_size: 4000,
                job_timeout_secs: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_MODELS__DEVICE=cuda`
    /// - `APP_MODELS__MODEL_DIR=/srv/models/whisper`
    /// - `APP_QUEUE__CHUNK_SIZE=4096`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    ///
    /// ## Checks:
    /// - port, beam width, token budget, chunk size and eviction delay are non-zero
    /// - device and precision names parse
    /// - a watchdog, when set, is non-zero
    ///
    /// ## Usage Example:
    /// ```
    /// use voice_transcriber::config::AppConfig;
    ///
    /// let mut config = AppConfig::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.queue.chunk_size = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.beam_size == 0 {
            return Err(anyhow::anyhow!("Beam size must be greater than 0"));
        }

        if self.models.max_tokens_per_window == 0 {
            return Err(anyhow::anyhow!("Token budget per window must be greater than 0"));
        }

        if self.models.language.trim().is_empty() {
            return Err(anyhow::anyhow!("Decoding language must not be empty"));
        }

        self.models
            .device
            .parse::<crate::device::DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.models
            .precision
            .parse::<crate::device::Precision>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.queue.chunk_size == 0 {
            return Err(anyhow::anyhow!("Chunk size must be greater than 0"));
        }

        if self.queue.idle_eviction_secs == 0 {
            return Err(anyhow::anyhow!("Idle eviction delay must be greater than 0"));
        }

        if self.queue.job_timeout_secs == Some(0) {
            return Err(anyhow::anyhow!("Job timeout must be greater than 0 when set"));
        }

        Ok(())
    }

    /// `idle_eviction_secs` as a `Duration`.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.queue.idle_eviction_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.queue.job_timeout_secs.map(Duration::from_secs)
    }
}
