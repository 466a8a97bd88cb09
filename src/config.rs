use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::index::Metric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub eval: EvalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

fn default_overlap() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            url: None,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub metric: Metric,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_max_context_chars() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_model() -> String {
    "claude-3-haiku-20240307".to_string()
}
fn default_llm_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_listed_events")]
    pub max_listed_events: usize,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_listed_events: default_max_listed_events(),
            language: default_language(),
        }
    }
}

fn default_max_listed_events() -> usize {
    24
}
fn default_language() -> String {
    "English".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvalConfig {
    #[serde(default = "default_eval_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub scenarios: Option<PathBuf>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            output_dir: default_eval_output_dir(),
            concurrency: default_concurrency(),
            scenarios: None,
        }
    }
}

fn default_eval_output_dir() -> PathBuf {
    PathBuf::from("evals/results")
}
fn default_concurrency() -> usize {
    1
}

impl EmbeddingConfig {
    /// The version tag stamped on every vector this configuration produces.
    ///
    /// Provider and model are both part of it: the same model name served
    /// by two providers is not assumed to produce identical vectors.
    pub fn model_version(&self) -> String {
        format!(
            "{}:{}",
            self.provider,
            self.model.as_deref().unwrap_or("default")
        )
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens == 0
        || config.chunking.overlap_tokens >= config.chunking.max_tokens
    {
        anyhow::bail!("chunking.overlap_tokens must be > 0 and < chunking.max_tokens");
    }

    // Retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() {
                anyhow::bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Language model
    match config.llm.provider.as_str() {
        "anthropic" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be anthropic or disabled.",
            other
        ),
    }

    if config.eval.concurrency == 0 {
        anyhow::bail!("eval.concurrency must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[corpus]
dir = "data/docs"

[chunking]
max_tokens = 200

[index]
path = "data/index.sqlite"
"#;

    fn parse(s: &str) -> Config {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(MINIMAL);
        validate(&config).unwrap();
        assert_eq!(config.chunking.overlap_tokens, 40);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.index.metric, Metric::Cosine);
        assert_eq!(config.corpus.include_globs.len(), 2);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_max() {
        let mut config = parse(MINIMAL);
        config.chunking.overlap_tokens = 200;
        assert!(validate(&config).is_err());
        config.chunking.overlap_tokens = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_remote_provider_requires_model_and_dims() {
        let mut config = parse(MINIMAL);
        config.embedding.provider = "openai".to_string();
        assert!(validate(&config).is_err());
        config.embedding.model = Some("text-embedding-3-small".to_string());
        config.embedding.dims = Some(1536);
        validate(&config).unwrap();
    }

    #[test]
    fn test_unknown_providers_rejected() {
        let mut config = parse(MINIMAL);
        config.llm.provider = "oracle".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_model_version_includes_provider() {
        let mut config = parse(MINIMAL);
        config.embedding.model = Some("mini".to_string());
        assert_eq!(config.embedding.model_version(), "hash:mini");
    }

    #[test]
    fn test_metric_parses_inner_product() {
        let config = parse(&MINIMAL.replace(
            "path = \"data/index.sqlite\"",
            "path = \"data/index.sqlite\"\nmetric = \"inner_product\"",
        ));
        assert_eq!(config.index.metric, Metric::InnerProduct);
    }
}
