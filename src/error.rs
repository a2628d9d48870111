// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::time::Duration;
use thiserror::Error;

use crate::ai::AiError;
use crate::models::auth::ErrorResponse;

/// Database error codes the application reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCode {
    /// 42P01: relation does not exist (schema not migrated)
    UndefinedTable,
    /// 23505: unique constraint violated
    UniqueViolation,
    /// PGRST116: the query matched no row
    NoRows,
    /// 42501: permission or row policy denied
    PermissionDenied,
    Other(String),
}

impl BackendCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "42P01" => BackendCode::UndefinedTable,
            "23505" => BackendCode::UniqueViolation,
            "PGRST116" => BackendCode::NoRows,
            "42501" => BackendCode::PermissionDenied,
            other => BackendCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackendCode::UndefinedTable => "42P01",
            BackendCode::UniqueViolation => "23505",
            BackendCode::NoRows => "PGRST116",
            BackendCode::PermissionDenied => "42501",
            BackendCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for BackendCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message content is empty")]
    Empty,
    #[error("Message is too long ({len} characters, maximum {max})")]
    TooLong { len: usize, max: usize },
    #[error("Message contains disallowed content")]
    Unsafe,
    #[error("{0}")]
    Invalid(String),
}

/// Whether the caller can expect a retry or a corrected request to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Network error: {0}")]
    Transport(String),
    #[error("Backend rejected the request ({code}): {message}")]
    Backend { code: BackendCode, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Not authenticated")]
    Unauthorized,
    #[error("Access denied: {0}")]
    Forbidden(String),
    #[error("{operation} timed out after {}ms", .limit.as_millis())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("A reply is already being generated for this session")]
    Busy,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn backend(code: BackendCode, message: impl Into<String>) -> Self {
        AppError::Backend {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn backend_code(&self) -> Option<&BackendCode> {
        match self {
            AppError::Backend { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.backend_code(), Some(BackendCode::UniqueViolation))
    }

    pub fn severity(&self) -> Severity {
        match self {
            AppError::Transport(_)
            | AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::Unauthorized
            | AppError::Timeout { .. }
            | AppError::Busy => Severity::Recoverable,
            AppError::Ai(e) => {
                if e.is_transient() {
                    Severity::Recoverable
                } else {
                    Severity::Fatal
                }
            }
            AppError::Backend { code, .. } => match code {
                BackendCode::UniqueViolation | BackendCode::NoRows => Severity::Recoverable,
                _ => Severity::Fatal,
            },
            AppError::Forbidden(_) | AppError::Internal(_) => Severity::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::Backend { code, .. } => match code {
                BackendCode::UniqueViolation => StatusCode::CONFLICT,
                BackendCode::NoRows => StatusCode::NOT_FOUND,
                BackendCode::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Ai(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Busy => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn code(&self) -> String {
        match self {
            AppError::Transport(_) => "network".to_string(),
            AppError::Backend { code, .. } => code.as_str().to_string(),
            AppError::Validation(_) => "validation".to_string(),
            AppError::Ai(_) => "ai_unavailable".to_string(),
            AppError::NotFound(_) => "not_found".to_string(),
            AppError::Unauthorized => "unauthorized".to_string(),
            AppError::Forbidden(_) => "forbidden".to_string(),
            AppError::Timeout { .. } => "timeout".to_string(),
            AppError::Busy => "busy".to_string(),
            AppError::Internal(_) => "internal".to_string(),
        }
    }
}

impl AppError {
    /// Message safe to show to clients; internal details stay in the logs.
    pub(crate) fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::Transport(_) => "The service is temporarily unreachable, please try again".to_string(),
            AppError::Backend { code, message } => match code {
                // The constraint name says which field clashed
                BackendCode::UniqueViolation if message.contains("email") => {
                    "An account with this email already exists".to_string()
                }
                BackendCode::UniqueViolation if message.contains("registration") => {
                    "This registration number is already registered".to_string()
                }
                BackendCode::UniqueViolation => "This record already exists".to_string(),
                BackendCode::NoRows => "The requested record was not found".to_string(),
                BackendCode::PermissionDenied => "Access denied".to_string(),
                other => format!("Backend error ({})", other),
            },
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::backend(BackendCode::NoRows, "no row found"),
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .code()
                    .map(|c| BackendCode::from_code(&c))
                    .unwrap_or_else(|| BackendCode::Other("unknown".to_string()));
                AppError::backend(code, db_err.message())
            }
            sqlx::Error::Io(e) => AppError::Transport(e.to_string()),
            sqlx::Error::PoolTimedOut => AppError::Transport("connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => AppError::Transport("connection pool closed".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, code = %self.code(), "request failed");
        } else {
            tracing::debug!(error = %self, code = %self.code(), "request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                success: false,
                message: self.public_message(),
                code: Some(self.code()),
            }),
        )
            .into_response()
    }
}
