// src/ai/mod.rs
pub mod http;
pub mod local;
pub mod prompt;
pub mod router;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{AiBackend, AiConfig};
pub use local::LocalInferenceClient;
pub use router::RouterClient;
pub use types::{ChatRole, ChatTurn, Completion, CompletionRequest, Usage};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Rate limited by completion endpoint")]
    RateLimited,
    #[error("Unexpected completion response: {0}")]
    Parse(String),
    #[error("Completion response had no content")]
    EmptyContent,
    #[error("Completion request cancelled")]
    Cancelled,
    #[error("Completion request timed out")]
    Timeout,
    #[error("AI provider not configured: {0}")]
    NotConfigured(String),
}

impl AiError {
    /// Failures where repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AiError::Network(_) | AiError::RateLimited | AiError::Timeout => true,
            AiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A chat-completion shaped HTTP service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn list_models(&self) -> Result<Vec<String>, AiError>;

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AiError>;
}

/// Builds the provider selected by `AI_PROVIDER`.
pub fn provider_from_config(config: &AiConfig) -> Result<Arc<dyn CompletionProvider>, AiError> {
    match config.backend {
        AiBackend::Local => Ok(Arc::new(LocalInferenceClient::new(
            config.local_base_url.clone(),
            config.model.clone(),
        ))),
        AiBackend::Router => {
            let api_key = config
                .router_api_key
                .clone()
                .ok_or_else(|| AiError::NotConfigured("ROUTER_API_KEY is not set".to_string()))?;
            Ok(Arc::new(RouterClient::new(
                config.router_base_url.clone(),
                api_key,
                config.model.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_transient_classification() {
        assert!(AiError::Network("reset".into()).is_transient());
        assert!(AiError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!AiError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!AiError::Parse("shape".into()).is_transient());
        assert!(!AiError::Cancelled.is_transient());
    }

    #[test]
    fn test_router_provider_requires_key() {
        let mut config = AppConfig::for_tests().ai;
        config.backend = AiBackend::Router;
        assert!(matches!(provider_from_config(&config), Err(AiError::NotConfigured(_))));

        config.router_api_key = Some("sk-test".into());
        assert_eq!(provider_from_config(&config).unwrap().name(), "router");

        config.backend = AiBackend::Local;
        assert_eq!(provider_from_config(&config).unwrap().name(), "local");
    }
}
