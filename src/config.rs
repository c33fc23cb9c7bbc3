use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::retrieval::SelectionLimits;

/// Service configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP listen address (e.g., "127.0.0.1:8787")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root directory that document storage locators are resolved against
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            documents_dir: default_documents_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require credentials (default: false for development)
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys (format: "key:user_id")
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used when the raw document file is attached to the request
    #[serde(default = "default_grounded_model")]
    pub grounded_model: String,

    /// Model used for text-only turns
    #[serde(default = "default_text_model")]
    pub text_model: String,

    /// Upper bound on one streamed generation, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Replaces the built-in system instructions
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            grounded_model: default_grounded_model(),
            text_model: default_text_model(),
            timeout_secs: default_timeout_secs(),
            instructions: None,
        }
    }
}

/// Sizes and budgets for document grounding and prompt assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_chunks: usize,
    pub max_selected_chunks: usize,
    pub max_selected_chars: usize,
    pub min_score: usize,
    pub max_prompt_chars: usize,
    pub max_history_messages: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1200,
            overlap: 200,
            max_chunks: 400,
            max_selected_chunks: 6,
            max_selected_chars: 6000,
            min_score: 1,
            max_prompt_chars: 16000,
            max_history_messages: 12,
        }
    }
}

impl RetrievalConfig {
    pub fn selection_limits(&self) -> SelectionLimits {
        SelectionLimits {
            max_chunks: self.max_selected_chunks,
            max_chars: self.max_selected_chars,
            min_score: self.min_score,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.overlap >= self.chunk_size {
            anyhow::bail!(
                "retrieval.overlap ({}) must be smaller than retrieval.chunk_size ({})",
                self.overlap,
                self.chunk_size
            );
        }
        if self.max_chunks == 0 || self.max_selected_chunks == 0 || self.max_selected_chars == 0 {
            anyhow::bail!("retrieval chunk limits must be greater than zero");
        }
        if self.min_score == 0 {
            anyhow::bail!("retrieval.min_score must be at least 1");
        }
        if self.max_prompt_chars == 0 {
            anyhow::bail!("retrieval.max_prompt_chars must be greater than zero");
        }
        Ok(())
    }
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/civic-assist.db")
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("./data/documents")
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_grounded_model() -> String {
    "gpt-4o".to_string()
}

fn default_text_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        Ok(Self::merge_with_env(config))
    }

    /// Override fields whose environment variable is set
    fn merge_with_env(mut config: Self) -> Self {
        if let Ok(addr) = std::env::var("CIVIC_ASSIST_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("CIVIC_ASSIST_DATABASE") {
            config.storage.database_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("CIVIC_ASSIST_DOCUMENTS_DIR") {
            config.storage.documents_dir = PathBuf::from(dir);
        }
        if let Ok(keys) = std::env::var("CIVIC_ASSIST_API_KEYS") {
            config.auth.api_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            config.auth.enabled = true;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.llm.base_url = base_url;
        }

        config
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        self.retrieval.validate()?;

        if self.auth.enabled && self.auth.api_keys.is_empty() {
            anyhow::bail!("Authentication enabled but no API keys configured");
        }
        if self.llm.timeout_secs == 0 {
            anyhow::bail!("llm.timeout_secs must be greater than zero");
        }

        Ok(())
    }
}
