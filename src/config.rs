//! Configuration loading: settings file, environment overrides, validation.
//!
//! Settings come from an optional TOML file (default
//! `./config/kedro-rag.toml`) and are then overridden by environment
//! variables, so a deployment can run from the environment alone:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `KEDRO_RAG_INDEX_PATH` | `[index].path` |
//! | `KEDRO_RAG_DOCS_URL` | `[sources.docs].url` |
//! | `SLACK_BOT_TOKEN` | `[sources.slack].token` |
//! | `KEDRO_RAG_SLACK_CHANNELS` | `[sources.slack].channels` (comma separated) |
//!
//! Validation runs once at startup. Every failure is a
//! [`KbError::Configuration`] naming the missing or invalid key and how to
//! set it.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{KbError, Result};

/// Default settings file location, used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/kedro-rag.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/kedro_knowledge.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}
fn default_overlap() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_max_k() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers (OpenAI-compatible or Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents committed per transaction.
    #[serde(default = "default_ingest_batch")]
    pub batch_size: usize,
    /// Writer lease lifetime; a crashed writer's lease expires after this.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ingest_batch(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_ingest_batch() -> usize {
    32
}
fn default_lease_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub docs: Option<DocsSourceConfig>,
    pub slack: Option<SlackSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocsSourceConfig {
    /// HTTP(S) URL of the text export, or a `file://` URL / local path.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl DocsSourceConfig {
    pub fn with_url(url: String) -> Self {
        Self {
            url,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackSourceConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_slack_api")]
    pub api_base: String,
    /// Channel ids (`C0123…`) or names (`kedro-help`, `#kedro-help`).
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_true")]
    pub include_threads: bool,
    #[serde(default)]
    pub questions_only: bool,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_slack_retries")]
    pub max_retries: u32,
    #[serde(default = "default_slack_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for SlackSourceConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_slack_api(),
            channels: Vec::new(),
            days_back: default_days_back(),
            include_threads: true,
            questions_only: false,
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_slack_retries(),
            retry_base_ms: default_slack_retry_base_ms(),
        }
    }
}

fn default_slack_api() -> String {
    "https://slack.com/api".to_string()
}
fn default_days_back() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_page_size() -> u32 {
    200
}
fn default_slack_retries() -> u32 {
    5
}
fn default_slack_retry_base_ms() -> u64 {
    1000
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

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

impl EmbeddingConfig {
    /// Model name with the provider's default filled in.
    pub fn resolved_model(&self) -> String {
        if let Some(m) = &self.model {
            return m.clone();
        }
        match self.provider.as_str() {
            "openai" => "text-embedding-3-small".to_string(),
            "local" => "all-minilm-l6-v2".to_string(),
            "ollama" => "nomic-embed-text".to_string(),
            _ => "feature-hash-v1".to_string(),
        }
    }

    /// Vector dimensionality with the provider's default filled in.
    pub fn resolved_dims(&self) -> usize {
        if let Some(d) = self.dims {
            return d;
        }
        match self.provider.as_str() {
            "openai" => 1536,
            "ollama" => 768,
            _ => 384,
        }
    }
}

impl Config {
    /// Parse a TOML document. Does not apply the environment or validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| KbError::Configuration(format!("failed to parse settings file: {}", e)))
    }

    /// Override settings from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Override settings from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty("KEDRO_RAG_INDEX_PATH") {
            self.index.path = PathBuf::from(path);
        }

        if let Some(url) = non_empty("KEDRO_RAG_DOCS_URL") {
            match self.sources.docs.as_mut() {
                Some(docs) => docs.url = url,
                None => self.sources.docs = Some(DocsSourceConfig::with_url(url)),
            }
        }

        if let Some(token) = non_empty("SLACK_BOT_TOKEN") {
            self.sources.slack.get_or_insert_with(Default::default).token = Some(token);
        }

        if let Some(channels) = non_empty("KEDRO_RAG_SLACK_CHANNELS") {
            self.sources.slack.get_or_insert_with(Default::default).channels = channels
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
    }

    /// Check every setting, naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.index.path.as_os_str().is_empty() {
            return Err(missing("index.path", "KEDRO_RAG_INDEX_PATH", "[index].path"));
        }

        if self.chunking.max_tokens == 0 {
            return Err(invalid("chunking.max_tokens must be > 0"));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(invalid(
                "chunking.overlap_tokens must be smaller than chunking.max_tokens",
            ));
        }

        if self.retrieval.max_k == 0 {
            return Err(invalid("retrieval.max_k must be >= 1"));
        }
        if self.retrieval.default_k == 0 || self.retrieval.default_k > self.retrieval.max_k {
            return Err(invalid(
                "retrieval.default_k must be in [1, retrieval.max_k]",
            ));
        }

        match self.embedding.provider.as_str() {
            "hashing" | "openai" | "ollama" | "local" => {}
            other => {
                return Err(invalid(&format!(
                    "unknown embedding.provider '{}': must be hashing, openai, ollama, or local",
                    other
                )))
            }
        }
        if self.embedding.resolved_dims() == 0 {
            return Err(invalid("embedding.dims must be > 0"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be > 0"));
        }

        if self.ingest.batch_size == 0 {
            return Err(invalid("ingest.batch_size must be > 0"));
        }

        if let Some(docs) = &self.sources.docs {
            if docs.url.trim().is_empty() {
                return Err(missing(
                    "sources.docs.url",
                    "KEDRO_RAG_DOCS_URL",
                    "[sources.docs].url",
                ));
            }
        }

        if let Some(slack) = &self.sources.slack {
            if slack.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
                return Err(missing(
                    "sources.slack.token",
                    "SLACK_BOT_TOKEN",
                    "[sources.slack].token",
                ));
            }
            if slack.days_back == 0 {
                return Err(invalid("sources.slack.days_back must be >= 1"));
            }
            if slack.page_size == 0 || slack.page_size > 1000 {
                return Err(invalid("sources.slack.page_size must be in [1, 1000]"));
            }
        }

        Ok(())
    }
}

fn missing(key: &str, env: &str, file_key: &str) -> KbError {
    KbError::Configuration(format!(
        "{} is not set (set the {} environment variable or {} in the settings file)",
        key, env, file_key
    ))
}

fn invalid(message: &str) -> KbError {
    KbError::Configuration(message.to_string())
}

/// Load settings: file (if any), then environment, then validation.
///
/// With `path = None` the default location is used when it exists and
/// defaults apply otherwise. An explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => read_file(p)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                read_file(default)?
            } else {
                Config::default()
            }
        }
    };

    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        KbError::Configuration(format!(
            "failed to read settings file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml_str(&content)
}
