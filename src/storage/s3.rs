//! S3-compatible storage backend.

use super::{
    FileData, ObjectStorage, ResourceType, StorageError, UploadOptions,
    UploadedObject,
};
use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusoto_core::{credential::StaticProvider, HttpClient, Region, RusotoError};
use rusoto_s3::{DeleteObjectRequest, PutObjectRequest, S3Client, S3};

const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Storage {
    s3: S3Client,
    config: S3Config,
    region: Region,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.config.bucket)
            .field("region", &self.region)
            .finish()
    }
}

fn region_for(config: &S3Config) -> Result<Region> {
    let name = if config.region.is_empty() {
        DEFAULT_REGION.to_owned()
    } else {
        config.region.clone()
    };
    match &config.endpoint {
        Some(endpoint) => Ok(Region::Custom {
            name,
            endpoint: endpoint.clone(),
        }),
        None => name
            .parse::<Region>()
            .with_context(|| format!("unknown AWS region {name}")),
    }
}

/// Map a rusoto failure onto [`StorageError`]. Rejected credentials come
/// back as an unparsed 401/403 response.
fn storage_error<E: std::error::Error + 'static>(err: RusotoError<E>) -> StorageError {
    match err {
        RusotoError::Credentials(e) => StorageError::Authentication(e.to_string()),
        RusotoError::HttpDispatch(e) => StorageError::Transport(e.to_string()),
        RusotoError::Unknown(res) => {
            let status = res.status.as_u16();
            let body = String::from_utf8_lossy(&res.body).into_owned();
            match status {
                401 | 403 => StorageError::Authentication(body),
                404 => StorageError::NotFound(body),
                _ => StorageError::Provider {
                    status: Some(status),
                    payload: serde_json::Value::String(body),
                },
            }
        }
        other => StorageError::Provider {
            status: None,
            payload: serde_json::Value::String(other.to_string()),
        },
    }
}

impl S3Storage {
    pub fn new(config: S3Config) -> Result<Self> {
        let region = region_for(&config)?;
        let dispatcher =
            HttpClient::new().context("failed to build S3 HTTP client")?;
        let credentials = StaticProvider::new_minimal(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
        );
        tracing::info!(bucket = %config.bucket, "S3Storage initialized");

        Ok(Self {
            s3: S3Client::new_with(dispatcher, credentials, region.clone()),
            config,
            region,
        })
    }

    fn check_credentials(&self) -> Result<(), StorageError> {
        if self.config.has_credentials() {
            Ok(())
        } else {
            Err(StorageError::Authentication(
                "AWS access key id and secret access key must be configured"
                    .into(),
            ))
        }
    }

    fn object_key(options: &UploadOptions, file_name: &str) -> String {
        let name = options.public_id.as_deref().unwrap_or(file_name);
        if options.folder.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", options.folder, name)
        }
    }

    /// Where a stored key can be fetched from.
    fn public_url(&self, key: &str) -> String {
        if let Some(base) = &self.config.public_url {
            return format!("{}/{key}", base.trim_end_matches('/'));
        }
        match &self.config.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{key}",
                endpoint.trim_end_matches('/'),
                self.config.bucket
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.config.bucket,
                self.region.name()
            ),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(
        &self,
        file: FileData,
        options: &UploadOptions,
    ) -> Result<UploadedObject, StorageError> {
        self.check_credentials()?;
        if file.bytes.is_empty() {
            return Err(StorageError::InvalidFile(format!(
                "{} is empty",
                file.file_name
            )));
        }

        let key = Self::object_key(options, &file.file_name);
        tracing::info!(key = %key, "S3Storage: put_object");
        let request = PutObjectRequest {
            bucket: self.config.bucket.clone(),
            key: key.clone(),
            content_type: Some(file.content_type),
            content_length: Some(file.bytes.len() as i64),
            body: Some(file.bytes.into()),
            ..Default::default()
        };
        self.s3.put_object(request).await.map_err(storage_error)?;

        Ok(UploadedObject {
            url: self.public_url(&key),
            public_id: key,
        })
    }

    async fn delete(
        &self,
        public_id: &str,
        _resource_type: ResourceType,
    ) -> Result<(), StorageError> {
        self.check_credentials()?;

        tracing::info!(key = %public_id, "S3Storage: delete_object");
        let request = DeleteObjectRequest {
            bucket: self.config.bucket.clone(),
            key: public_id.to_owned(),
            ..Default::default()
        };
        self.s3.delete_object(request).await.map_err(storage_error)?;

        Ok(())
    }
}
