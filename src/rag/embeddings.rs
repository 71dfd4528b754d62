use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::Client;

use crate::config::{EmbeddingBackend, Settings};
use crate::error::{status_is_retryable, RagError, Result};
use crate::models::{EmbeddingRequest, EmbeddingResponse};
use super::retry::{with_retry, RetryConfig};

/// Concurrent batch requests per `embed_documents` call.
const MAX_IN_FLIGHT_BATCHES: usize = 4;

/// Turns text into vectors. Every vector from one provider lives in the same
/// embedding space, identified by `model_id`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Output dimension, when known before the first call.
    fn dimension(&self) -> Option<usize>;

    /// One vector per input, in input order.
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_documents(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::embedding("provider returned no vector for query", false))
    }
}

/// OpenAI `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    batch_size: usize,
    retry: RetryConfig,
}

impl OpenAiEmbeddings {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            batch_size: 64,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        with_retry(&self.retry, "embeddings", || self.embed_batch_once(batch)).await
    }

    async fn embed_batch_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: batch,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::embedding(format!("request failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::embedding(
                format!("embedding request failed: {} - {}", status, body),
                status_is_retryable(status),
            ));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::embedding(format!("invalid response body: {}", e), false))?;

        if parsed.data.len() != batch.len() {
            return Err(RagError::embedding(
                format!("expected {} vectors, got {}", batch.len(), parsed.data.len()),
                false,
            ));
        }
        parsed.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        if let Some(expected) = self.dimension() {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(RagError::embedding(
                    format!("expected dimension {}, got {}", expected, bad.len()),
                    false,
                ));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        match self.model.as_str() {
            "text-embedding-3-large" => Some(3072),
            "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
            _ => None,
        }
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let owned: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(owned)
            .map(|batch| async move { self.embed_batch(&batch).await })
            .buffered(MAX_IN_FLIGHT_BATCHES)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }
}

/// Offline ONNX model loaded from a local directory.
pub struct LocalEmbeddings {
    model: Arc<TextEmbedding>,
    model_id: String,
}

impl LocalEmbeddings {
    pub fn new(model_dir: &Path) -> anyhow::Result<Self> {
        tracing::info!("Initializing embedding model from {}", model_dir.display());

        if !model_dir.exists() {
            anyhow::bail!("Model directory not found: {}", model_dir.display());
        }

        let read = |name: &str| -> anyhow::Result<Vec<u8>> {
            std::fs::read(model_dir.join(name))
                .with_context(|| format!("Failed to read {}", name))
        };

        let user_model = UserDefinedEmbeddingModel {
            onnx_file: read("model.onnx")?,
            tokenizer_files: TokenizerFiles {
                tokenizer_file: read("tokenizer.json")?,
                config_file: read("config.json")?,
                special_tokens_map_file: read("special_tokens_map.json")?,
                tokenizer_config_file: read("tokenizer_config.json")?,
            },
        };

        let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
            .map_err(|e| anyhow::anyhow!("Failed to initialize embedding model: {}", e))?;

        let model_id = format!(
            "local:{}",
            model_dir.file_name().unwrap_or_default().to_string_lossy()
        );
        tracing::info!(model_id = %model_id, "Embedding model initialized");
        Ok(Self {
            model: Arc::new(model),
            model_id,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddings {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| RagError::embedding(format!("embedding task failed: {}", e), false))?
            .map_err(|e| RagError::embedding(e.to_string(), false))
    }
}

/// The provider selected by `embedding.provider`. Only the OpenAI backend
/// needs an API key.
pub fn provider_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match settings.embedding.provider {
        EmbeddingBackend::OpenAi => Arc::new(
            OpenAiEmbeddings::new(
                &settings.openai.base_url,
                settings.require_api_key()?,
                &settings.openai.embedding_model,
                Duration::from_secs(settings.openai.request_timeout_secs),
            )?
            .with_batch_size(settings.embedding.batch_size)
            .with_retry(settings.retry_config()),
        ),
        EmbeddingBackend::Local => Arc::new(LocalEmbeddings::new(&settings.embedding.local_model_dir)?),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_openai_dimensions() {
        let large = OpenAiEmbeddings::new(
            "http://localhost/v1/",
            "k",
            "text-embedding-3-large",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(large.dimension(), Some(3072));
        assert_eq!(large.base_url, "http://localhost/v1");

        let custom =
            OpenAiEmbeddings::new("http://localhost", "k", "my-model", Duration::from_secs(1))
                .unwrap();
        assert_eq!(custom.dimension(), None);
        assert_eq!(custom.model_id(), "my-model");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_retryable_error() {
        let provider = OpenAiEmbeddings::new(
            "http://127.0.0.1:9",
            "k",
            "text-embedding-3-large",
            Duration::from_secs(2),
        )
        .unwrap()
        .with_retry(RetryConfig::none());

        let err = provider.embed_query("hello").await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingProvider { retryable: true, .. }));
    }

    #[tokio::test]
    async fn test_batched_request_runs_on_spawned_task() {
        let provider = Arc::new(
            OpenAiEmbeddings::new("http://127.0.0.1:9", "k", "m", Duration::from_secs(2))
                .unwrap()
                .with_batch_size(2)
                .with_retry(RetryConfig::none()),
        );
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();

        let task = tokio::spawn(async move { provider.embed_documents(texts).await });
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RagError::EmbeddingProvider { retryable: true, .. }));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_request() {
        let provider =
            OpenAiEmbeddings::new("http://127.0.0.1:9", "k", "m", Duration::from_secs(1)).unwrap();
        assert!(provider.embed_documents(Vec::new()).await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_local_model_dir() {
        let result = LocalEmbeddings::new(Path::new("/nonexistent/model"));
        assert!(result.is_err());
    }
}
