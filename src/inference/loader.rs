use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::{byte_level::ByteLevel, PreTokenizerWrapper};
use tokenizers::processors::{roberta::RobertaProcessing, PostProcessorWrapper};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use super::bart::Config;
use super::generation::{GenerationConfig, GenerationConfigFile};
use crate::config::AppConfig;

/// Paths of the files one model snapshot is made of.
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    pub config: PathBuf,
    pub tokenizer: TokenizerFiles,
    pub weights: PathBuf,
    pub generation_config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum TokenizerFiles {
    Json(PathBuf),
    VocabMerges { vocab: PathBuf, merges: PathBuf },
}

impl SnapshotFiles {
    /// Local directory laid out like a hub snapshot.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        if !config.exists() {
            return Err(anyhow!("config.json not found under {}", dir.display()));
        }

        let tokenizer = if dir.join("tokenizer.json").exists() {
            TokenizerFiles::Json(dir.join("tokenizer.json"))
        } else if dir.join("vocab.json").exists() && dir.join("merges.txt").exists() {
            TokenizerFiles::VocabMerges {
                vocab: dir.join("vocab.json"),
                merges: dir.join("merges.txt"),
            }
        } else {
            return Err(anyhow!(
                "neither tokenizer.json nor vocab.json + merges.txt found under {}",
                dir.display()
            ));
        };

        let weights = dir.join("model.safetensors");
        if !weights.exists() {
            return Err(anyhow!("model.safetensors not found in {:?}", dir));
        }

        let generation_config = Some(dir.join("generation_config.json")).filter(|p| p.exists());

        Ok(Self {
            config,
            tokenizer,
            weights,
            generation_config,
        })
    }

    /// Fetches (or reuses from the local cache) the snapshot on the hub.
    pub async fn from_hub(model_id: &str, revision: &str) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .map_err(|e| anyhow!("Failed to initialize HuggingFace API: {e}"))?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let repo = &repo;
        let fetch = move |name: &'static str| async move {
            repo.get(name)
                .await
                .with_context(|| format!("Failed to download '{name}' from '{model_id}'"))
        };

        info!(model = model_id, revision, "resolving model snapshot from the hub");
        let config = fetch("config.json").await?;
        let weights = fetch("model.safetensors").await?;

        let tokenizer = match fetch("tokenizer.json").await {
            Ok(path) => TokenizerFiles::Json(path),
            Err(err) => {
                warn!("tokenizer.json unavailable ({err:#}), falling back to vocab.json + merges.txt");
                TokenizerFiles::VocabMerges {
                    vocab: fetch("vocab.json").await?,
                    merges: fetch("merges.txt").await?,
                }
            }
        };

        let generation_config = match fetch("generation_config.json").await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("generation_config.json unavailable ({err:#}), using built-in defaults");
                None
            }
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
            generation_config,
        })
    }

    pub async fn resolve(cfg: &AppConfig) -> Result<Self> {
        match &cfg.model_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "using local model snapshot");
                Self::from_dir(dir)
            }
            None => Self::from_hub(&cfg.model_id, &cfg.revision).await,
        }
    }

    pub fn load_config(&self) -> Result<Config> {
        let raw = fs::read(&self.config)
            .with_context(|| format!("failed to read {}", self.config.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", self.config.display()))
    }

    pub fn load_generation_config(&self, model: &Config) -> Result<GenerationConfig> {
        let base = GenerationConfig::for_model(model);
        let Some(path) = &self.generation_config else {
            return Ok(base);
        };
        let raw =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let file: GenerationConfigFile = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(base.merge_file(&file))
    }

    pub fn load_tokenizer(&self) -> Result<Tokenizer> {
        match &self.tokenizer {
            TokenizerFiles::Json(path) => Tokenizer::from_file(path)
                .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", path.display())),
            TokenizerFiles::VocabMerges { vocab, merges } => build_bpe_tokenizer(vocab, merges),
        }
    }
}

/// Byte-level BPE with `<s> ... </s>` wrapping, the tokenizer BART was
/// trained with.
fn build_bpe_tokenizer(vocab: &Path, merges: &Path) -> Result<Tokenizer> {
    let bpe = BPE::from_file(
        vocab
            .to_str()
            .ok_or_else(|| anyhow!("Invalid vocab path"))?,
        merges
            .to_str()
            .ok_or_else(|| anyhow!("Invalid merges path"))?,
    )
    .unk_token("<unk>".to_string())
    .build()
    .map_err(|e| anyhow!("BPE tokenizer build error: {e}"))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(PreTokenizerWrapper::ByteLevel(ByteLevel::new(
        false, true, true,
    ))));
    tokenizer.with_decoder(Some(DecoderWrapper::ByteLevel(ByteLevel::default())));

    let bos = tokenizer
        .token_to_id("<s>")
        .ok_or_else(|| anyhow!("<s> missing from vocab"))?;
    let eos = tokenizer
        .token_to_id("</s>")
        .ok_or_else(|| anyhow!("</s> missing from vocab"))?;
    tokenizer.with_post_processor(Some(PostProcessorWrapper::Roberta(RobertaProcessing::new(
        ("</s>".to_string(), eos),
        ("<s>".to_string(), bos),
    ))));

    Ok(tokenizer)
}
