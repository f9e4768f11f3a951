//! # Model Sourcing
//!
//! Finds the Whisper weights, trying the cheapest option first:
//! 1. **Local directory**: `models.model_dir` already holds a complete model
//! 2. **Hub cache**: a Hugging Face cache snapshot inside `model_dir`
//!    (`models--{org}--{name}/snapshots/<revision>`), newest revision wins
//! 3. **Remote**: download through `hf-hub`, cached into `model_dir` so the
//!    next start finds it in step 2
//!
//! Incomplete local copies are logged and skipped, never fatal on their own.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files a model directory must contain to be usable.
pub const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    LocalDir,
    HubCache,
    Remote,
}

/// Paths of the three artifacts the loader needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelResolver {
    repo: String,
    model_dir: PathBuf,
}

impl ModelResolver {
    pub fn new(repo: impl Into<String>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            model_dir: model_dir.into(),
        }
    }

    /// Locate the model files, downloading them if no usable local copy exists.
    pub async fn resolve(&self) -> Result<(ModelFiles, ModelSource)> {
        if let Some(found) = self.resolve_local() {
            return Ok(found);
        }
        let files = self.fetch_remote().await?;
        Ok((files, ModelSource::Remote))
    }

    /// Steps 1 and 2: look only at the filesystem.
    pub fn resolve_local(&self) -> Option<(ModelFiles, ModelSource)> {
        match missing_files(&self.model_dir) {
            None => {
                info!(dir = %self.model_dir.display(), "Using local model directory");
                return Some((ModelFiles::in_dir(&self.model_dir), ModelSource::LocalDir));
            }
            Some(missing) if self.model_dir.exists() => {
                debug!(
                    dir = %self.model_dir.display(),
                    missing = ?missing,
                    "Model directory is not a complete model"
                );
            }
            Some(_) => {}
        }

        let snapshot = self.latest_snapshot()?;
        match missing_files(&snapshot) {
            None => {
                info!(snapshot = %snapshot.display(), "Using cached model snapshot");
                Some((ModelFiles::in_dir(&snapshot), ModelSource::HubCache))
            }
            Some(missing) => {
                warn!(
                    snapshot = %snapshot.display(),
                    missing = ?missing,
                    "Cached model snapshot is incomplete, ignoring it"
                );
                None
            }
        }
    }

    /// `model_dir/models--{org}--{name}/snapshots`
    pub fn snapshots_dir(&self) -> PathBuf {
        let cache_name = format!("models--{}", self.repo.replace('/', "--"));
        self.model_dir.join(cache_name).join("snapshots")
    }

    /// Newest snapshot by directory name.
    fn latest_snapshot(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(self.snapshots_dir()).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .max_by(|a, b| a.file_name().cmp(&b.file_name()))
    }

    async fn fetch_remote(&self) -> Result<ModelFiles> {
        use hf_hub::api::tokio::ApiBuilder;

        let token = std::env::var("HF_TOKEN").ok().filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!("HF_TOKEN is not set, downloading anonymously (rate limits may apply)");
        }

        std::fs::create_dir_all(&self.model_dir)?;
        info!(repo = %self.repo, cache = %self.model_dir.display(), "Downloading model from Hugging Face");

        let api = ApiBuilder::new()
            .with_token(token)
            .with_cache_dir(self.model_dir.clone())
            .with_progress(false)
            .build()
            .map_err(|e| anyhow!("failed to initialize Hugging Face client: {}", e))?;
        let repo = api.model(self.repo.clone());

        let mut paths = Vec::with_capacity(REQUIRED_FILES.len());
        for file in REQUIRED_FILES {
            let path = repo
                .get(file)
                .await
                .map_err(|e| anyhow!("failed to download {} from {}: {}", file, self.repo, e))?;
            debug!(file, path = %path.display(), "Model file ready");
            paths.push(path);
        }

        let weights = paths.pop().ok_or_else(|| anyhow!("weights path missing"))?;
        let tokenizer = paths.pop().ok_or_else(|| anyhow!("tokenizer path missing"))?;
        let config = paths.pop().ok_or_else(|| anyhow!("config path missing"))?;
        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Required files absent (or empty) in `dir`, or `None` when it is complete.
fn missing_files(dir: &Path) -> Option<Vec<&'static str>> {
    let missing: Vec<&'static str> = REQUIRED_FILES
        .iter()
        .copied()
        .filter(|name| {
            std::fs::metadata(dir.join(name))
                .map(|meta| meta.len() == 0)
                .unwrap_or(true)
        })
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}
