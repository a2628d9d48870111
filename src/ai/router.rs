use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::http::{send_with_retry, RetryPolicy};
use super::types::{parse_chat_completion, parse_model_list, ChatCompletionBody};
use super::{AiError, Completion, CompletionProvider, CompletionRequest};

/// Client for a hosted model-router API (OpenRouter-compatible).
#[derive(Debug, Clone)]
pub struct RouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    retry: RetryPolicy,
}

impl RouterClient {
    pub fn new(base_url: String, api_key: String, default_model: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "Doc+")
    }
}

#[async_trait]
impl CompletionProvider for RouterClient {
    fn name(&self) -> &str {
        "router"
    }

    async fn list_models(&self) -> Result<Vec<String>, AiError> {
        let url = format!("{}/models", self.base_url);
        let body = send_with_retry("router/models", &self.retry, &CancellationToken::new(), || {
            self.authorized(self.client.get(&url))
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
        let body = ChatCompletionBody {
            model,
            messages: &request.turns,
            temperature: request.temperature.unwrap_or(0.7),
            max_tokens: request.max_tokens.unwrap_or(1024),
            stream: false,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let text = send_with_retry("router/chat", &self.retry, cancel, || {
            self.authorized(self.client.post(&url).json(&body))
        })
        .await?;

        parse_chat_completion(&text, model)
    }
}
