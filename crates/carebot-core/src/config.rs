//! Carebot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CarebotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarebotConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl CarebotConfig {
    /// Load config from the default path (~/.carebot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CarebotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CarebotError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CarebotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.knowledge.chunk_size == 0 {
            return Err(CarebotError::Config("knowledge.chunk_size must be > 0".into()));
        }
        if self.knowledge.chunk_overlap >= self.knowledge.chunk_size {
            return Err(CarebotError::Config(format!(
                "knowledge.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.knowledge.chunk_overlap, self.knowledge.chunk_size
            )));
        }
        if self.embedding.dimensions == 0 {
            return Err(CarebotError::Config("embedding.dimensions must be > 0".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(CarebotError::Config("embedding.batch_size must be > 0".into()));
        }
        if self.embedding.max_attempts == 0 {
            return Err(CarebotError::Config("embedding.max_attempts must be > 0".into()));
        }
        if self.storage.pool_size == 0 {
            return Err(CarebotError::Config("storage.pool_size must be > 0".into()));
        }
        if self.chat.stream_buffer == 0 {
            return Err(CarebotError::Config("chat.stream_buffer must be > 0".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Carebot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".carebot")
    }
}

/// Expand `~` and `$VAR` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(p).map(|s| s.into_owned()).unwrap_or_else(|_| p.to_string()))
}

/// Chat model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the provider's base URL when non-empty.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String { "openai".into() }
fn default_model() -> String { "gpt-4o-mini".into() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 1024 }
fn default_request_timeout() -> u64 { 120 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: String::new(),
            endpoint: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Deployment-wide vector dimension `D`.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_embedding_model() -> String { "text-embedding-3-small".into() }
fn default_dimensions() -> usize { 1536 }
fn default_batch_size() -> usize { 64 }
fn default_max_attempts() -> u32 { 4 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8000 }

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Knowledge base (ingestion + retrieval) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_docs_dir")]
    pub docs_dir: String,
    /// HuggingFace `tokenizer.json` matching the embedding provider's token counting.
    #[serde(default = "default_tokenizer_path")]
    pub tokenizer_path: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

fn default_docs_dir() -> String { "~/.carebot/docs".into() }
fn default_tokenizer_path() -> String { "~/.carebot/tokenizer.json".into() }
fn default_chunk_size() -> usize { 512 }
fn default_chunk_overlap() -> usize { 150 }
fn default_top_k() -> usize { 10 }
fn default_max_top_k() -> usize { 25 }

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            docs_dir: default_docs_dir(),
            tokenizer_path: default_tokenizer_path(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

/// Conversation turn configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Number of most recent persisted messages replayed to the model.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Capacity of the token channel between generation and delivery.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Persist the partial answer when the client disconnects mid-stream.
    #[serde(default)]
    pub persist_partial: bool,
    /// Append a condensed `tool` record of each knowledge query to the chat.
    #[serde(default)]
    pub record_tool_queries: bool,
}

fn default_context_window() -> usize { 20 }
fn default_max_tool_rounds() -> usize { 3 }
fn default_stream_buffer() -> usize { 32 }

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            max_tool_rounds: default_max_tool_rounds(),
            stream_buffer: default_stream_buffer(),
            persist_partial: false,
            record_tool_queries: false,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_storage_path() -> String { "~/.carebot/carebot.db".into() }
fn default_pool_size() -> usize { 8 }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 8000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}
