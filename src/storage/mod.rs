//! Blob storage for note attachments.
//!
//! Two providers sit behind [`ObjectStorage`]:
//! - `cloudinary`: signed REST uploads to Cloudinary
//! - `s3`: S3-compatible object storage (AWS S3, MinIO, ...)
//!
//! The provider is chosen and configured once at startup and handed to the
//! request handlers through `AppState`. Missing credentials do not stop the
//! server from booting; each call fails with
//! [`StorageError::Authentication`] instead.

pub mod cloudinary;
#[cfg(test)]
pub mod memory;
pub mod s3;

use super::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::{path::Path, sync::Arc};

/// Folder (or key prefix) every note attachment is uploaded under.
pub const UPLOAD_FOLDER: &str = "notes_uploads";

const OFFICE_MIME_TYPES: [&str; 6] = [
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Credentials are absent, or the provider refused them.
    #[error("storage authentication failed: {0}")]
    Authentication(String),
    /// The provider answered, but with an error.
    #[error("storage provider error: {payload}")]
    Provider {
        status: Option<u16>,
        payload: serde_json::Value,
    },
    /// The provider could not be reached.
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error("stored object not found: {0}")]
    NotFound(String),
    #[error("invalid file: {0}")]
    InvalidFile(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Provider-side bucket for a file; Cloudinary needs it on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Image,
    Raw,
}

impl ResourceType {
    /// Images and PDFs are stored as `image`, office documents as `raw`.
    /// Anything else is not accepted as a note attachment.
    pub fn classify(content_type: &str) -> Option<Self> {
        if content_type.starts_with("image/") || content_type == "application/pdf"
        {
            Some(Self::Image)
        } else if OFFICE_MIME_TYPES.contains(&content_type) {
            Some(Self::Raw)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileData {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub folder: String,
    pub public_id: Option<String>,
    pub resource_type: ResourceType,
}

impl UploadOptions {
    /// Options used for note attachments: the shared upload folder and a
    /// public id derived from the original file name.
    pub fn for_attachment(file: &FileData, resource_type: ResourceType) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            folder: UPLOAD_FOLDER.to_owned(),
            public_id: Some(attachment_public_id(
                &file.file_name,
                resource_type,
                now,
            )),
            resource_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub url: String,
    pub public_id: String,
}

/// `{stem}-{millis}`; raw files keep their extension because the provider
/// will not infer a format for them.
pub fn attachment_public_id(
    file_name: &str,
    resource_type: ResourceType,
    millis: i64,
) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("file");
    let mut public_id = format!("{stem}-{millis}");
    if resource_type == ResourceType::Raw {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            public_id.push('.');
            public_id.push_str(ext);
        }
    }

    public_id
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + std::fmt::Debug {
    /// Upload a file and return where it can be fetched from.
    async fn upload(
        &self,
        file: FileData,
        options: &UploadOptions,
    ) -> Result<UploadedObject, StorageError>;

    /// Remove a previously uploaded object.
    async fn delete(
        &self,
        public_id: &str,
        resource_type: ResourceType,
    ) -> Result<(), StorageError>;
}

/// Build the configured provider. Called once at startup.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStorage>> {
    let storage: Arc<dyn ObjectStorage> = match config {
        StorageConfig::Cloudinary(c) => {
            Arc::new(cloudinary::CloudinaryStorage::new(c.clone()))
        }
        StorageConfig::S3(c) => Arc::new(s3::S3Storage::new(c.clone())?),
    };
    if !config.has_credentials() {
        tracing::warn!(
            provider = config.provider_name(),
            "storage credentials are missing; uploads will fail"
        );
    }

    Ok(storage)
}
