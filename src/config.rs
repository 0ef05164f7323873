//! TOML configuration.
//!
//! Every command reads a single file passed via `--config`. Only `[db]`,
//! `[chunking]`, and `[server]` are required; all other sections fall back to
//! defaults that work against a local OpenAI account.
//!
//! ```toml
//! [db]
//! path = "./data/docchat.sqlite"
//!
//! [storage]
//! data_dir = "./data/files"
//! converted_dir = "./data/converted_files"
//! public_base_url = "http://localhost:8000"
//!
//! [chunking]
//! max_tokens = 250
//! overlap_tokens = 50
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where uploaded and converted files live on disk.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of uploaded files; one subdirectory per folder. Served under `/static`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Side directory for plain-text conversions (`<stem>.txt`).
    #[serde(default = "default_converted_dir")]
    pub converted_dir: PathBuf,
    /// Externally visible base URL used when building static links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            converted_dir: default_converted_dir(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_converted_dir() -> PathBuf {
    PathBuf::from("./data/converted_files")
}
fn default_public_base_url() -> String {
    "http://localhost:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

fn default_overlap() -> usize {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks fetched from the vector index per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Collection used by uploads and by queries that name none.
    #[serde(default = "default_collection")]
    pub default_collection: String,
    /// Embeddings name used by uploads.
    #[serde(default = "default_embeddings")]
    pub default_embeddings: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            default_collection: default_collection(),
            default_embeddings: default_embeddings(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_collection() -> String {
    "betaCollection".to_string()
}
fn default_embeddings() -> String {
    "openai".to_string()
}

/// Settings shared by every embedder. Which embedder runs is chosen per call
/// by its embeddings name (`openai`, `ollama`, `local`).
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama embedder.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub default_model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// USD per 1000 prompt tokens, used for the `cost` field of query responses.
    #[serde(default = "default_prompt_cost")]
    pub prompt_cost_per_1k: f64,
    /// USD per 1000 completion tokens.
    #[serde(default = "default_completion_cost")]
    pub completion_cost_per_1k: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: default_llm_model(),
            base_url: default_llm_base_url(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout_secs(),
            prompt_cost_per_1k: default_prompt_cost(),
            completion_cost_per_1k: default_completion_cost(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_prompt_cost() -> f64 {
    0.0015
}
fn default_completion_cost() -> f64 {
    0.002
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// File receiving one JSON line per answered query.
    #[serde(default = "default_query_log")]
    pub query_log: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            query_log: default_query_log(),
        }
    }
}

fn default_query_log() -> PathBuf {
    PathBuf::from("./data/query_log.log")
}

impl Config {
    /// A config with every path rooted under `root`. Used by tests and by
    /// commands that can run without a config file.
    pub fn with_root(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("docchat.sqlite"),
            },
            storage: StorageConfig {
                data_dir: root.join("files"),
                converted_dir: root.join("converted_files"),
                public_base_url: default_public_base_url(),
            },
            chunking: ChunkingConfig {
                max_tokens: 250,
                overlap_tokens: 0,
            },
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:8000".to_string(),
                cors_origins: Vec::new(),
            },
            logging: LoggingConfig {
                query_log: root.join("query_log.log"),
            },
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

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.default_collection.trim().is_empty() {
        anyhow::bail!("retrieval.default_collection must not be empty");
    }

    match config.retrieval.default_embeddings.as_str() {
        "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embeddings name: '{}'. Must be openai, ollama, or local.",
            other
        ),
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("docchat.toml");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./db.sqlite"

[chunking]
max_tokens = 200

[server]
bind = "127.0.0.1:9000"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.retrieval.top_k, 4);
        assert_eq!(cfg.retrieval.default_collection, "betaCollection");
        assert_eq!(cfg.retrieval.default_embeddings, "openai");
        assert_eq!(cfg.chunking.overlap_tokens, 0);
        assert!(cfg.server.cors_origins.is_empty());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_max() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./db.sqlite"

[chunking]
max_tokens = 100
overlap_tokens = 100

[server]
bind = "127.0.0.1:9000"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_rejects_unknown_embeddings_name() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./db.sqlite"

[chunking]
max_tokens = 100

[retrieval]
default_embeddings = "word2vec"

[server]
bind = "127.0.0.1:9000"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("word2vec"));
    }

    #[test]
    fn test_with_root_is_valid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::with_root(tmp.path());
        assert!(validate(&cfg).is_ok());
        assert!(cfg.storage.data_dir.starts_with(tmp.path()));
    }
}
