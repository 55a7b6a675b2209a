//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the `GemisConfig` struct, which holds the configuration parameters,
//! and a `load_config` function to load the configuration from a YAML file.
//!
//! Every field except the API credentials has a default, so a minimal file only
//! needs `api_base`, `api_key` and `model`.
//!
//! # Examples
//!
//! ```no_run
//! use gemis::config::{GemisConfig, load_config};
//!
//! let config: GemisConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Which [`crate::embeddings::Embedder`] backs the retrieval index.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Candle BERT sentence embeddings (downloads the model on first use).
    #[default]
    Bert,
    /// Offline hashed bag-of-words embeddings.
    Hashed,
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct GemisConfig {
    /// The base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// The API key used to authenticate requests to the API.
    pub api_key: String,

    /// The model used for replies.
    pub model: String,

    /// The model used for chat titles. Falls back to `model`.
    #[serde(default)]
    pub title_model: Option<String>,

    /// Leading system instruction of every reply prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // The context size of the model.
    #[serde(default = "default_context_max_tokens")]
    pub context_max_tokens: u32,

    // Tokens reserved for the reply.
    #[serde(default = "default_assistant_minimum_context_tokens")]
    pub assistant_minimum_context_tokens: u32,

    #[serde(default)]
    pub stop_words: Vec<String>,

    // Chat store (SQLite path).
    #[serde(default = "default_session_db_url")]
    pub session_db_url: String,

    /// Root directory for stored uploads.
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,

    /// Retrieval index snapshot file.
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,

    /// Passages retrieved per reply.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Upload size ceiling in megabytes.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Accepted upload extensions, with leading dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Session lifetime from login.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer using the provided document excerpts when they are relevant."
        .to_string()
}

fn default_context_max_tokens() -> u32 {
    8192
}

fn default_assistant_minimum_context_tokens() -> u32 {
    2048
}

fn default_session_db_url() -> String {
    "gemis.db".to_string()
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_index_path() -> PathBuf {
    PathBuf::from("gemis_index.bin")
}

fn default_retrieval_top_k() -> usize {
    4
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".pdf".to_string()]
}

fn default_session_ttl_secs() -> u64 {
    3600
}

impl Default for GemisConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5001/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            title_model: None,
            system_prompt: default_system_prompt(),
            context_max_tokens: default_context_max_tokens(),
            assistant_minimum_context_tokens: default_assistant_minimum_context_tokens(),
            stop_words: Vec::new(),
            session_db_url: default_session_db_url(),
            upload_root: default_upload_root(),
            index_path: default_index_path(),
            embedding_backend: EmbeddingBackend::default(),
            retrieval_top_k: default_retrieval_top_k(),
            max_file_size_mb: default_max_file_size_mb(),
            allowed_extensions: default_allowed_extensions(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl GemisConfig {
    pub fn title_model(&self) -> &str {
        self.title_model.as_deref().unwrap_or(&self.model)
    }

    /// Token budget for prompt content: `context_max_tokens - assistant_minimum_context_tokens`.
    pub fn prompt_budget(&self) -> usize {
        self.context_max_tokens
            .saturating_sub(self.assistant_minimum_context_tokens) as usize
    }

    /// Resolve relative storage locations against `base`.
    ///
    /// `:memory:` and absolute paths are left alone.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        if self.session_db_url != ":memory:" && Path::new(&self.session_db_url).is_relative() {
            self.session_db_url = base.join(&self.session_db_url).to_string_lossy().into_owned();
        }
        if self.upload_root.is_relative() {
            self.upload_root = base.join(&self.upload_root);
        }
        if self.index_path.is_relative() {
            self.index_path = base.join(&self.index_path);
        }
        self
    }
}

/// Loads the application's configuration from a YAML file.
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid YAML for
/// [`GemisConfig`].
pub fn load_config(file: &str) -> Result<GemisConfig, Box<dyn Error>> {
    debug!(file, "loading config");
    let content = fs::read_to_string(file)?;
    let config: GemisConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Write `config` as YAML, creating parent directories.
pub fn save_config(config: &GemisConfig, file: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(file, serde_yaml::to_string(config)?)?;
    Ok(())
}
