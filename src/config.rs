use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::extract::TieBreak;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for OpenAI-compatible or Ollama endpoints.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Minimum cosine similarity for a candidate to attach to an existing entity.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    /// Which entity wins when several share the best score.
    #[serde(default = "default_tie_break")]
    pub tie_break: TieBreak,
    #[serde(default = "default_extraction_chunks")]
    pub context_chunks: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            tie_break: default_tie_break(),
            context_chunks: default_extraction_chunks(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_chunks")]
    pub context_chunks: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            context_chunks: default_completion_chunks(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_router_threshold")]
    pub threshold: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: default_router_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Pipelines allowed to run at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs allowed to wait for a worker before refreshes are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_match_threshold() -> f32 {
    0.20
}
fn default_tie_break() -> TieBreak {
    TieBreak::EarliestCreated
}
fn default_extraction_chunks() -> usize {
    8
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_completion_chunks() -> usize {
    4
}
fn default_router_threshold() -> f32 {
    0.45
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    16
}
fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// In-code configuration with every section at its default.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/ptrack.sqlite"),
            },
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            extraction: ExtractionConfig::default(),
            completion: CompletionConfig::default(),
            router: RouterConfig::default(),
            jobs: JobsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
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
    if !(0.0..=1.0).contains(&config.extraction.match_threshold) {
        anyhow::bail!("extraction.match_threshold must be in [0.0, 1.0]");
    }
    if config.extraction.context_chunks == 0 {
        anyhow::bail!("extraction.context_chunks must be >= 1");
    }
    if config.extraction.max_context_chars == 0 {
        anyhow::bail!("extraction.max_context_chars must be > 0");
    }
    if config.completion.context_chunks == 0 {
        anyhow::bail!("completion.context_chunks must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.router.threshold) {
        anyhow::bail!("router.threshold must be in [0.0, 1.0]");
    }
    if config.jobs.workers == 0 {
        anyhow::bail!("jobs.workers must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.llm.model.is_none() {
                anyhow::bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hashing.",
            other
        ),
    }

    Ok(())
}
