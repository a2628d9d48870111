// src/ai/http.rs
use backoff::{future::retry, ExponentialBackoff};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::AiError;

/// Retry and timeout settings shared by the completion clients.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time spent retrying before giving up; `Some(ZERO)` disables retries
    pub max_elapsed: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
            max_elapsed: Some(Duration::from_secs(30)),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry(request_timeout: Duration) -> Self {
        Self {
            max_elapsed: Some(Duration::ZERO),
            request_timeout,
            ..Default::default()
        }
    }
}

/// Sends the request built by `build`, retrying transient failures with
/// exponential backoff, and returns the response body of a 2xx response.
///
/// Cancelling `cancel` drops the in-flight request.
pub(crate) async fn send_with_retry<F>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    build: F,
) -> Result<String, AiError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let backoff_config = ExponentialBackoff {
        initial_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        multiplier: 2.0,
        max_elapsed_time: policy.max_elapsed,
        ..Default::default()
    };

    let build = &build;
    let request_timeout = policy.request_timeout;

    // Retry on connection errors, timeouts, 429 and 5xx gateway errors
    let operation = move || async move {
        let response = build()
            .timeout(request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::warn!(endpoint = label, "completion request timed out (retrying)");
                    backoff::Error::transient(AiError::Timeout)
                } else if e.is_connect() {
                    tracing::warn!(endpoint = label, error = %e, "completion endpoint unreachable (retrying)");
                    backoff::Error::transient(AiError::Network(e.to_string()))
                } else {
                    tracing::error!(endpoint = label, error = %e, "completion request failed");
                    backoff::Error::permanent(AiError::Network(e.to_string()))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| backoff::Error::permanent(AiError::Network(format!("Failed to read response: {}", e))))?;

        tracing::debug!(endpoint = label, status = status.as_u16(), bytes = body.len(), "completion endpoint responded");

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(endpoint = label, "completion endpoint rate limited (retrying)");
            return Err(backoff::Error::transient(AiError::RateLimited));
        }

        if matches!(status.as_u16(), 500 | 502 | 503) {
            tracing::warn!(endpoint = label, status = status.as_u16(), "completion endpoint error (retrying)");
            return Err(backoff::Error::transient(AiError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        if !status.is_success() {
            tracing::error!(endpoint = label, status = status.as_u16(), "completion endpoint rejected request");
            return Err(backoff::Error::permanent(AiError::Status {
                status: status.as_u16(),
                body,
            }));
        }

        Ok(body)
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!(endpoint = label, "completion request cancelled");
            Err(AiError::Cancelled)
        }
        result = retry(backoff_config, operation) => result,
    }
}
