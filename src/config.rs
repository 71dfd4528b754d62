use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::rag::retry::RetryConfig;

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
const CONFIG_FILE: &str = "rag-chatbot";
const ENV_PREFIX: &str = "RAG";
/// `RUST_LOG` fallback shared by both binaries.
pub const DEFAULT_LOG_FILTER: &str = "info,rag_chatbot=debug";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is not set. Export it or add it to a .env file before starting.")]
    MissingApiKey,

    #[error("Invalid chunking parameters: overlap {overlap} must be smaller than chunk size {size}")]
    InvalidChunking { size: usize, overlap: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub index: IndexSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub session: SessionSettings,
    pub openai: OpenAiSettings,
    pub embedding: EmbeddingSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    pub path: PathBuf,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub condense_question: bool,
    pub max_history_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub idle_ttl_secs: u64,
    pub max_sessions: usize,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAi,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingBackend,
    pub local_model_dir: PathBuf,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Settings {
    /// Defaults, then `rag-chatbot.toml`, then `RAG_*` env vars.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let raw = config::Config::builder()
            .set_default("server.bind", "0.0.0.0:8000")?
            .set_default("server.max_upload_bytes", 25 * 1024 * 1024)?
            .set_default("index.path", "faiss_index")?
            .set_default("index.upload_dir", "uploads")?
            .set_default("chunking.chunk_size", 1000)?
            .set_default("chunking.chunk_overlap", 200)?
            .set_default("retrieval.top_k", 3)?
            .set_default("retrieval.condense_question", true)?
            .set_default("retrieval.max_history_tokens", 3000)?
            .set_default("session.idle_ttl_secs", 3600)?
            .set_default("session.max_sessions", 1000)?
            .set_default("session.sweep_interval_secs", 60)?
            .set_default("openai.base_url", "https://api.openai.com/v1")?
            .set_default("openai.embedding_model", "text-embedding-3-large")?
            .set_default("openai.chat_model", "gpt-4o")?
            .set_default("openai.temperature", 0.0)?
            .set_default("openai.request_timeout_secs", 60)?
            .set_default("embedding.provider", "openai")?
            .set_default("embedding.local_model_dir", "models/bge-small-en-v1.5")?
            .set_default("embedding.batch_size", 64)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.initial_delay_ms", 500)?
            .set_default("retry.max_delay_ms", 8000)?
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let mut settings: Settings = raw
            .try_deserialize()
            .context("Failed to parse configuration")?;
        settings.openai.api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|key| !key.trim().is_empty());
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ChunkingSettings {
            chunk_size,
            chunk_overlap,
        } = self.chunking;
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidChunking {
                size: chunk_size,
                overlap: chunk_overlap,
            });
        }
        Ok(())
    }

    /// The OpenAI key, or the startup diagnostic when it is absent.
    pub fn require_api_key(&self) -> Result<String, ConfigError> {
        self.openai.api_key.clone().ok_or(ConfigError::MissingApiKey)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.idle_ttl_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            server: ServerSettings {
                bind: "127.0.0.1:0".to_string(),
                max_upload_bytes: 1024,
            },
            index: IndexSettings {
                path: PathBuf::from("faiss_index"),
                upload_dir: PathBuf::from("uploads"),
            },
            chunking: ChunkingSettings {
                chunk_size: 1000,
                chunk_overlap: 200,
            },
            retrieval: RetrievalSettings {
                top_k: 3,
                condense_question: true,
                max_history_tokens: 3000,
            },
            session: SessionSettings {
                idle_ttl_secs: 3600,
                max_sessions: 10,
                sweep_interval_secs: 60,
            },
            openai: OpenAiSettings {
                base_url: "http://localhost".to_string(),
                embedding_model: "text-embedding-3-large".to_string(),
                chat_model: "gpt-4o".to_string(),
                temperature: 0.0,
                request_timeout_secs: 5,
                api_key: None,
            },
            embedding: EmbeddingSettings {
                provider: EmbeddingBackend::OpenAi,
                local_model_dir: PathBuf::from("models"),
                batch_size: 16,
            },
            retry: RetrySettings {
                max_attempts: 0,
                initial_delay_ms: 10,
                max_delay_ms: 100,
            },
        }
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut s = settings();
        s.chunking.chunk_overlap = 1000;
        assert!(matches!(
            s.validate(),
            Err(ConfigError::InvalidChunking { .. })
        ));
        s.chunking.chunk_overlap = 200;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_is_diagnosed() {
        let s = settings();
        let err = s.require_api_key().unwrap_err();
        assert!(err.to_string().contains(API_KEY_VAR));
    }

    #[test]
    fn test_retry_config_has_at_least_one_attempt() {
        let s = settings();
        assert_eq!(s.retry_config().max_attempts, 1);
    }
}
