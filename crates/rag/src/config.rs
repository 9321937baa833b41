use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use knowhub_llm::LlmProvider;

use crate::error::{RagError, Result};

pub const DEFAULT_DB_PATH: &str = "knowhub.sqlite";
pub const DEFAULT_CONFIG_PATH: &str = "knowhub.toml";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;
pub const DEFAULT_RETRIEVE_K: usize = 10;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 4000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_ESCALATION_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    Hash,
}

impl EmbeddingProvider {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "ollama" => Some(EmbeddingProvider::Ollama),
            "hash" => Some(EmbeddingProvider::Hash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub db_path: PathBuf,
    pub ollama_base_url: Option<String>,
    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: usize,
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub retrieve_k: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub timeout: Duration,
    pub escalation_threshold: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            ollama_base_url: None,
            embedding_provider: EmbeddingProvider::Ollama,
            embedding_model: None,
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            provider: LlmProvider::Ollama,
            model: None,
            retrieve_k: DEFAULT_RETRIEVE_K,
            top_k: DEFAULT_TOP_K,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }
}

/// Optional `knowhub.toml`. Every key may be overridden by its env var.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    db_path: Option<PathBuf>,
    ollama_base_url: Option<String>,
    embedding_provider: Option<String>,
    embedding_model: Option<String>,
    embedding_dimensions: Option<usize>,
    provider: Option<String>,
    model: Option<String>,
    retrieve_k: Option<usize>,
    top_k: Option<usize>,
    max_context_chars: Option<usize>,
    timeout_secs: Option<u64>,
    escalation_threshold: Option<f32>,
}

impl RagConfig {
    /// Reads `KNOWHUB_CONFIG` (default `knowhub.toml`) if present, then
    /// applies environment overrides and validates the result.
    pub fn from_env() -> Result<Self> {
        let config_path =
            env::var("KNOWHUB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let file = load_file_config(Path::new(&config_path))?;
        let config = Self::from_sources(file, |key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(contents).map_err(RagError::configuration)?;
        let config = Self::from_sources(file, |_| None)?;
        config.validate()?;
        Ok(config)
    }

    fn from_sources(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let provider_name = lookup("KNOWHUB_PROVIDER").or(file.provider);
        let provider = match provider_name {
            Some(name) => LlmProvider::from_str(&name).ok_or_else(|| {
                RagError::Configuration(format!("unknown generation provider {name}"))
            })?,
            None => defaults.provider,
        };
        let embedding_provider_name =
            lookup("KNOWHUB_EMBEDDING_PROVIDER").or(file.embedding_provider);
        let embedding_provider = match embedding_provider_name {
            Some(name) => EmbeddingProvider::from_str(&name).ok_or_else(|| {
                RagError::Configuration(format!("unknown embedding provider {name}"))
            })?,
            None => defaults.embedding_provider,
        };
        Ok(Self {
            db_path: lookup("KNOWHUB_DB")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or(defaults.db_path),
            ollama_base_url: lookup("OLLAMA_BASE_URL").or(file.ollama_base_url),
            embedding_provider,
            embedding_model: lookup("OLLAMA_EMBEDDING_MODEL").or(file.embedding_model),
            embedding_dimensions: parse_var(&lookup, "KNOWHUB_EMBEDDING_DIMENSIONS")?
                .or(file.embedding_dimensions)
                .unwrap_or(defaults.embedding_dimensions),
            provider,
            model: model_var(&lookup, provider).or(file.model),
            retrieve_k: parse_var(&lookup, "KNOWHUB_RETRIEVE_K")?
                .or(file.retrieve_k)
                .unwrap_or(defaults.retrieve_k),
            top_k: parse_var(&lookup, "KNOWHUB_TOP_K")?
                .or(file.top_k)
                .unwrap_or(defaults.top_k),
            max_context_chars: parse_var(&lookup, "KNOWHUB_MAX_CONTEXT_CHARS")?
                .or(file.max_context_chars)
                .unwrap_or(defaults.max_context_chars),
            timeout: parse_var::<u64>(&lookup, "KNOWHUB_TIMEOUT_SECS")?
                .or(file.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            escalation_threshold: parse_var(&lookup, "KNOWHUB_ESCALATION_THRESHOLD")?
                .or(file.escalation_threshold)
                .unwrap_or(defaults.escalation_threshold),
        })
    }

    /// Missing endpoints or models for the selected providers are startup
    /// errors, never per-request fallbacks.
    pub fn validate(&self) -> Result<()> {
        let needs_ollama = self.embedding_provider == EmbeddingProvider::Ollama
            || self.provider == LlmProvider::Ollama;
        if needs_ollama && is_blank(&self.ollama_base_url) {
            return Err(RagError::Configuration(
                "OLLAMA_BASE_URL must be set for the ollama provider".to_string(),
            ));
        }
        if self.embedding_provider == EmbeddingProvider::Ollama && is_blank(&self.embedding_model)
        {
            return Err(RagError::Configuration(
                "OLLAMA_EMBEDDING_MODEL must be set for ollama embeddings".to_string(),
            ));
        }
        if self.provider != LlmProvider::Local && is_blank(&self.model) {
            return Err(RagError::Configuration(format!(
                "KNOWHUB_MODEL must be set for the {} provider",
                self.provider.as_str()
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(RagError::Configuration(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        if self.top_k == 0 || self.retrieve_k == 0 {
            return Err(RagError::Configuration(
                "top_k and retrieve_k must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.escalation_threshold) {
            return Err(RagError::Configuration(format!(
                "escalation threshold {} is outside [0, 1]",
                self.escalation_threshold
            )));
        }
        Ok(())
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| RagError::Configuration(format!("reading {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| RagError::Configuration(format!("parsing {}: {e}", path.display())))
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RagError::Configuration(format!("{key} has invalid value {raw:?}"))),
        None => Ok(None),
    }
}

/// `KNOWHUB_MODEL` names the generation model for any provider; the ollama
/// provider also honours `OLLAMA_MODEL`.
fn model_var(lookup: &impl Fn(&str) -> Option<String>, provider: LlmProvider) -> Option<String> {
    lookup("KNOWHUB_MODEL").or_else(|| match provider {
        LlmProvider::Ollama => lookup("OLLAMA_MODEL"),
        _ => None,
    })
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}
