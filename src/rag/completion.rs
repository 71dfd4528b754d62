use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;

use crate::error::{status_is_retryable, RagError, Result};
use crate::models::{ChatRequest, ChatResponse, Message};
use super::retry::{with_retry, RetryConfig};

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Returns the assistant's reply to `messages`.
    async fn complete(&self, messages: Vec<Message>) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    retry: RetryConfig,
}

impl OpenAiChat {
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
            temperature: None,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| RagError::llm(format!("request failed: {}", e), true))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::llm(
                format!("chat completion failed: {} - {}", status, error_text),
                status_is_retryable(status),
            ));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::llm(format!("invalid response body: {}", e), false))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| RagError::llm("response contained no choices", false))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChat {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: None,
        };
        with_retry(&self.retry, "chat completion", || self.complete_once(&request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_unset_options() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::user("hi")],
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_unreachable_llm_is_retryable_error() {
        let chat = OpenAiChat::new("http://127.0.0.1:9/", "k", "gpt-4o", Duration::from_secs(2))
            .unwrap()
            .with_retry(RetryConfig::none());
        let err = chat.complete(vec![Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, RagError::LlmProvider { retryable: true, .. }));
    }
}
