// src/ai/local.rs
use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::http::{send_with_retry, RetryPolicy};
use super::types::{
    flatten_turns, parse_chat_completion, parse_model_list, parse_text_completion, ChatCompletionBody,
    TextCompletionBody,
};
use super::{AiError, Completion, CompletionProvider, CompletionRequest};

/// Client for a self-hosted OpenAI-compatible inference server
/// (LM Studio, llama.cpp server, vLLM) reached through a reverse proxy.
#[derive(Debug, Clone)]
pub struct LocalInferenceClient {
    client: Client,
    base_url: String,
    default_model: String,
    retry: RetryPolicy,
}

impl LocalInferenceClient {
    pub fn new(base_url: String, default_model: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn chat_completion(
        &self,
        model: &str,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AiError> {
        let body = ChatCompletionBody {
            model,
            messages: &request.turns,
            temperature: request.temperature.unwrap_or(0.7),
            max_tokens: request.max_tokens.unwrap_or(1024),
            stream: false,
        };
        let url = format!("{}/v1/chat/completions", self.base_url);

        let text = send_with_retry("local/chat", &self.retry, cancel, || {
            self.client.post(&url).json(&body)
        })
        .await?;

        parse_chat_completion(&text, model)
    }

    async fn text_completion(
        &self,
        model: &str,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AiError> {
        let body = TextCompletionBody {
            model,
            prompt: flatten_turns(&request.turns),
            temperature: request.temperature.unwrap_or(0.7),
            max_tokens: request.max_tokens.unwrap_or(1024),
            stop: ["\nUser:"],
        };
        let url = format!("{}/v1/completions", self.base_url);

        let text = send_with_retry("local/completions", &self.retry, cancel, || {
            self.client.post(&url).json(&body)
        })
        .await?;

        parse_text_completion(&text, model)
    }
}

#[async_trait]
impl CompletionProvider for LocalInferenceClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_models(&self) -> Result<Vec<String>, AiError> {
        let url = format!("{}/v1/models", self.base_url);
        let body = send_with_retry("local/models", &self.retry, &CancellationToken::new(), || {
            self.client.get(&url)
        })
        .await?;
        parse_model_list(&body)
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AiError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);

        match self.chat_completion(model, request, cancel).await {
            Ok(completion) => Ok(completion),
            // Older servers only expose the text completion endpoint
            Err(e @ (AiError::Network(_) | AiError::Status { .. })) => {
                tracing::warn!(error = %e, "chat completion failed, falling back to /v1/completions");
                self.text_completion(model, request, cancel).await
            }
            Err(e) => Err(e),
        }
    }
}
