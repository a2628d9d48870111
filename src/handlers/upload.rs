use crate::error::{AppError, ValidationError};
use crate::middleware::auth::auth_middleware;
use crate::models::auth::Claims;
use crate::models::file::{RejectedFile, UploadResponse};
use crate::services::attachments::{AttachmentError, MAX_ATTACHMENT_BYTES};
use crate::AppState;
use axum::{
    extract::{multipart::Multipart, DefaultBodyLimit, Extension},
    response::Json,
    routing::post,
    Router,
};
use std::sync::Arc;

use super::caller_id;

/// Files per request
const MAX_FILES: usize = 10;

pub fn upload_routes() -> Router {
    Router::new()
        .route("/api/uploads", post(upload_files))
        .layer(DefaultBodyLimit::max(MAX_FILES * MAX_ATTACHMENT_BYTES))
        .layer(axum::middleware::from_fn(auth_middleware))
}

/// Stores every `files` field of the form. Unsupported or oversized files
/// are reported back without failing the others.
async fn upload_files(
    Extension(state): Extension<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let user_id = caller_id(&claims)?;
    let mut files = Vec::new();
    let mut rejected = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!("Failed to parse multipart field: {}", e);
        ValidationError::Invalid(format!("Malformed upload: {}", e))
    })? {
        if field.name() != Some("files") {
            tracing::debug!(field = ?field.name(), "skipping non-file field");
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();

        if files.len() + rejected.len() >= MAX_FILES {
            rejected.push(RejectedFile {
                name,
                reason: format!("At most {} files per upload", MAX_FILES),
            });
            continue;
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| ValidationError::Invalid(format!("Failed to read {}: {}", name, e)))?;

        match state.attachments.upload(user_id, &name, &data).await {
            Ok(file) => files.push(file),
            Err(AttachmentError::Storage(e)) => {
                tracing::error!(%user_id, file = %name, error = %e, "attachment storage failed");
                return Err(AppError::Internal(format!("Failed to store {}", name)));
            }
            Err(e) => {
                tracing::info!(%user_id, file = %name, reason = %e, "attachment rejected");
                rejected.push(RejectedFile {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    let message = format!("{} file(s) uploaded, {} rejected", files.len(), rejected.len());
    Ok(Json(UploadResponse {
        success: !files.is_empty(),
        files,
        rejected,
        message,
    }))
}
