// src/email.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("Email function unreachable: {0}")]
    Network(String),
    #[error("Email function returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Payload of the welcome email sent to a newly registered patient.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmail {
    pub patient_name: String,
    pub patient_email: String,
    pub temporary_password: String,
    pub doctor_name: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(&self, email: &WelcomeEmail) -> Result<(), EmailError>;
}

/// Client for the hosted "send patient welcome" function.
#[derive(Debug, Clone)]
pub struct EmailFunctionClient {
    client: Client,
    function_url: String,
    api_key: Option<String>,
}

impl EmailFunctionClient {
    pub fn new(function_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            function_url,
            api_key,
        }
    }
}

#[async_trait]
impl Mailer for EmailFunctionClient {
    async fn send_welcome(&self, email: &WelcomeEmail) -> Result<(), EmailError> {
        let mut request = self
            .client
            .post(&self.function_url)
            .timeout(Duration::from_secs(15))
            .json(email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmailError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "welcome email rejected");
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(to = %email.patient_email, "📧 welcome email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_http;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;

    fn welcome() -> WelcomeEmail {
        WelcomeEmail {
            patient_name: "Jane Doe".into(),
            patient_email: "jane@patients.test".into(),
            temporary_password: "Tmp12345abcd".into(),
            doctor_name: "Amira Hassan".into(),
        }
    }

    #[tokio::test]
    async fn test_posts_camel_case_payload_with_bearer() {
        let app = Router::new().route(
            "/send-patient-welcome",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let authorized = headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer fn-key");
                if !authorized || body["patientName"] != "Jane Doe" || body["temporaryPassword"] != "Tmp12345abcd" {
                    return StatusCode::BAD_REQUEST;
                }
                StatusCode::OK
            }),
        );
        let base = spawn_http(app).await;
        let client = EmailFunctionClient::new(format!("{}/send-patient-welcome", base), Some("fn-key".into()));

        client.send_welcome(&welcome()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_is_rejected() {
        let app = Router::new().route("/fn", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "smtp down") }));
        let base = spawn_http(app).await;
        let client = EmailFunctionClient::new(format!("{}/fn", base), None);

        let err = client.send_welcome(&welcome()).await.unwrap_err();
        assert!(matches!(err, EmailError::Rejected { status: 500, .. }));
    }
}
