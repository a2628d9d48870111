use serde::{Deserialize, Serialize};

/// An attachment staged while composing a message. Lives only for the
/// duration of the compose interaction; no table row backs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Storage path inside the bucket
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub public_url: String,
    pub extracted_text: String,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub files: Vec<UploadedFile>,
    pub rejected: Vec<RejectedFile>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectedFile {
    pub name: String,
    pub reason: String,
}
