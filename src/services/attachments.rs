// src/services/attachments.rs
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::file::UploadedFile;
use crate::storage::{ObjectStorage, StorageError};

pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

const BINARY_PLACEHOLDER: &str = "[Binary file content - text extraction not available]";

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("{name} is {size} bytes, the limit is {limit}")]
    TooLarge { name: String, size: usize, limit: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// MIME type for a supported attachment, judged by extension.
pub fn detect_mime(filename: &str) -> Option<&'static str> {
    let mime = match extension_of(filename).as_str() {
        // Text
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",

        // Documents
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",

        // Images
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",

        _ => return None,
    };
    Some(mime)
}

/// `<user_id>/<millis>_<uuid>.<ext>`
pub fn storage_path(user_id: Uuid, filename: &str, now: DateTime<Utc>) -> String {
    let ext = extension_of(filename);
    let stem = format!("{}/{}_{}", user_id, now.timestamp_millis(), Uuid::new_v4());
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

fn extract_text(mime: &str, bytes: &[u8]) -> String {
    if mime.starts_with("text/") {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        BINARY_PLACEHOLDER.to_string()
    }
}

#[derive(Clone)]
pub struct AttachmentService {
    storage: Arc<dyn ObjectStorage>,
}

impl AttachmentService {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub async fn upload(&self, user_id: Uuid, filename: &str, bytes: &[u8]) -> Result<UploadedFile, AttachmentError> {
        let mime = detect_mime(filename).ok_or_else(|| AttachmentError::UnsupportedType(filename.to_string()))?;
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(AttachmentError::TooLarge {
                name: filename.to_string(),
                size: bytes.len(),
                limit: MAX_ATTACHMENT_BYTES,
            });
        }

        let path = storage_path(user_id, filename, Utc::now());
        let stored = self.storage.upload(&path, bytes, mime).await?;
        let checksum = hex::encode(Sha256::digest(bytes));

        tracing::info!(%user_id, path = %stored, mime, size = bytes.len(), "📎 attachment uploaded");

        Ok(UploadedFile {
            public_url: self.storage.public_url(&stored),
            id: stored,
            name: filename.to_string(),
            size: bytes.len() as u64,
            mime_type: mime.to_string(),
            extracted_text: extract_text(mime, bytes),
            checksum,
        })
    }
}
