//! Model file locations
//!
//! The weight file always lives in the configured models directory. The
//! tokenizer is taken from the same directory when present, otherwise it is
//! fetched from the HuggingFace Hub at a pinned revision.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::config::Config;

/// Weight file looked up in the models directory unless overridden.
pub const DEFAULT_WEIGHTS_FILE: &str = "model-q4_0.gguf";

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_REPO: &str = "vikhyatk/moondream2";
/// Revision matching the weights of `moondream::Config::v2()`.
pub const TOKENIZER_REVISION: &str = "2024-03-06";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// Quantized GGUF checkpoint
    Gguf,
    /// Full precision safetensors checkpoint
    Safetensors,
}

impl WeightsFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "gguf" => Some(Self::Gguf),
            "safetensors" => Some(Self::Safetensors),
            _ => None,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::Gguf)
    }
}

/// Everything the engine needs to load a model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub weights: PathBuf,
    pub format: WeightsFormat,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Locate the weight and tokenizer files for a validated configuration.
    pub async fn resolve(config: &Config) -> Result<Self> {
        let tokenizer = resolve_tokenizer(
            &config.models_dir,
            &config.tokenizer_repo,
            &config.tokenizer_revision,
        )
        .await?;

        Ok(Self {
            weights: config.weights_path.clone(),
            format: config.weights_format,
            tokenizer,
        })
    }
}

async fn resolve_tokenizer(models_dir: &Path, repo_id: &str, revision: &str) -> Result<PathBuf> {
    let local = models_dir.join(TOKENIZER_FILE);
    if local.is_file() {
        tracing::info!("Using local tokenizer: {:?}", local);
        return Ok(local);
    }

    tracing::info!(
        "No {} in {:?}, fetching {} @ {}",
        TOKENIZER_FILE,
        models_dir,
        repo_id,
        revision
    );
    let api = hf_hub::api::tokio::Api::new().wrap_err("Failed to initialize HuggingFace Hub client")?;
    let repo = api.repo(hf_hub::Repo::with_revision(
        repo_id.to_string(),
        hf_hub::RepoType::Model,
        revision.to_string(),
    ));
    repo.get(TOKENIZER_FILE)
        .await
        .wrap_err_with(|| format!("Failed to fetch tokenizer from {}@{}", repo_id, revision))
}
