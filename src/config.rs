use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

pub const DEFAULT_MODEL_ID: &str = "facebook/bart-large-cnn";
const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_REVISION: &str = "main";

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub addr: String,
    pub model_id: String,
    pub model_dir: Option<PathBuf>,
    pub revision: String,
    pub threads: usize,
    pub eager_load: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_dir: None,
            revision: DEFAULT_REVISION.to_string(),
            threads: num_cpus::get_physical().max(1),
            eager_load: true,
        }
    }
}

impl AppConfig {
    /// Loads `.env` and `config/summarizer.env` (if present), then reads the
    /// `SUMMARIZER_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        dotenvy::from_filename("config/summarizer.env").ok();

        let defaults = Self::default();

        let threads = match non_empty_var("SUMMARIZER_THREADS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("SUMMARIZER_THREADS is not a number: {raw}"))?
                .max(1),
            None => defaults.threads,
        };

        let eager_load = match non_empty_var("SUMMARIZER_EAGER_LOAD") {
            Some(raw) => parse_flag(&raw)
                .ok_or_else(|| anyhow!("SUMMARIZER_EAGER_LOAD must be true/false, got {raw}"))?,
            None => defaults.eager_load,
        };

        Ok(Self {
            addr: non_empty_var("SUMMARIZER_ADDR").unwrap_or(defaults.addr),
            model_id: non_empty_var("SUMMARIZER_MODEL_ID").unwrap_or(defaults.model_id),
            model_dir: non_empty_var("SUMMARIZER_MODEL_DIR").map(PathBuf::from),
            revision: non_empty_var("SUMMARIZER_MODEL_REVISION").unwrap_or(defaults.revision),
            threads,
            eager_load,
        })
    }

    /// Process-wide knobs that must be set before any tokenizer or tensor
    /// kernel spins up its thread pool.
    pub fn apply_process_env(&self) {
        if env::var_os("TOKENIZERS_PARALLELISM").is_none() {
            env::set_var("TOKENIZERS_PARALLELISM", "false");
        }
        if env::var_os("RAYON_NUM_THREADS").is_none() {
            env::set_var("RAYON_NUM_THREADS", self.threads.to_string());
        } else {
            warn!("RAYON_NUM_THREADS already set, ignoring SUMMARIZER_THREADS");
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    dotenvy::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
