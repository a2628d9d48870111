// src/storage.rs
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Bucket-style object storage for chat attachments.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `path` and returns the path.
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;

    fn public_url(&self, path: &str) -> String;
}

/// Filesystem-backed storage laid out as `<root>/<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    bucket: String,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root),
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let clean = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.bucket_dir().join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&target).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        tracing::debug!(path, content_type, size = bytes.len(), "object stored");
        Ok(path.to_string())
    }

    fn public_url(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}/{}", self.public_base_url, self.bucket, encoded.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path) -> LocalObjectStorage {
        LocalObjectStorage::new(&StorageConfig {
            root: root.to_string_lossy().into_owned(),
            bucket: "chat-attachments".to_string(),
            public_base_url: "https://files.docplus.test/".to_string(),
        })
    }

    #[tokio::test]
    async fn test_upload_writes_under_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let path = storage.upload("user-1/123_abc.txt", b"hello", "text/plain").await.unwrap();
        assert_eq!(path, "user-1/123_abc.txt");

        let written = std::fs::read(dir.path().join("chat-attachments/user-1/123_abc.txt")).unwrap();
        assert_eq!(written, b"hello");
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        for bad in ["../secret.txt", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                storage.upload(bad, b"x", "text/plain").await,
                Err(StorageError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_public_url_encodes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let url = storage(dir.path()).public_url("user-1/my scan.pdf");
        assert_eq!(url, "https://files.docplus.test/chat-attachments/user-1/my%20scan.pdf");
    }
}
