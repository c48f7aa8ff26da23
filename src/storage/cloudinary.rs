//! Cloudinary storage over its signed REST API.
//!
//! Requests are signed with SHA-256: the signed parameters sorted by name,
//! joined as `k=v&k=v`, with the API secret appended. The account has to
//! accept SHA-256 signatures.

use super::{
    FileData, ObjectStorage, ResourceType, StorageError, UploadOptions,
    UploadedObject,
};
use crate::config::CloudinaryConfig;
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;

#[derive(Debug)]
pub struct CloudinaryStorage {
    config: CloudinaryConfig,
    http: Client,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

impl CloudinaryStorage {
    pub fn new(config: CloudinaryConfig) -> Self {
        tracing::info!(cloud = %config.cloud_name, "CloudinaryStorage initialized");
        Self {
            config,
            http: Client::new(),
        }
    }

    fn check_credentials(&self) -> Result<(), StorageError> {
        if self.config.has_credentials() {
            Ok(())
        } else {
            Err(StorageError::Authentication(
                "Cloudinary cloud name, API key and API secret must be configured"
                    .into(),
            ))
        }
    }

    fn endpoint(&self, resource_type: ResourceType, action: &str) -> String {
        format!(
            "{}/v1_1/{}/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.cloud_name,
            resource_type.as_str(),
            action
        )
    }

    fn sign(&self, params: &[(&str, &str)]) -> String {
        sign_params(params, &self.config.api_secret)
    }
}

/// Hex SHA-256 of the sorted, `&`-joined params followed by the secret.
/// Empty values are not signed.
pub fn sign_params(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut params: Vec<_> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    params.sort_by_key(|(k, _)| *k);
    let to_sign = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(api_secret.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Turn a non-2xx provider response into a [`StorageError`].
async fn provider_error(res: Response) -> StorageError {
    let status = res.status();
    let payload = match res.text().await {
        Ok(body) => serde_json::from_str(&body)
            .unwrap_or(serde_json::Value::String(body)),
        Err(e) => serde_json::Value::String(e.to_string()),
    };
    if status.as_u16() == 401 || status.as_u16() == 403 {
        StorageError::Authentication(payload.to_string())
    } else if status.as_u16() == 404 {
        StorageError::NotFound(payload.to_string())
    } else {
        StorageError::Provider {
            status: Some(status.as_u16()),
            payload,
        }
    }
}

#[async_trait]
impl ObjectStorage for CloudinaryStorage {
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

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let public_id = options.public_id.clone().unwrap_or_default();
        let signature = self.sign(&[
            ("folder", options.folder.as_str()),
            ("public_id", public_id.as_str()),
            ("timestamp", timestamp.as_str()),
        ]);

        let part = Part::bytes(file.bytes)
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .map_err(|e| StorageError::InvalidFile(e.to_string()))?;
        let mut form = Form::new()
            .part("file", part)
            .text("api_key", self.config.api_key.clone())
            .text("timestamp", timestamp)
            .text("folder", options.folder.clone())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");
        if !public_id.is_empty() {
            form = form.text("public_id", public_id);
        }

        tracing::info!(
            file = %file.file_name,
            resource_type = options.resource_type.as_str(),
            "uploading to Cloudinary"
        );
        let res = self
            .http
            .post(self.endpoint(options.resource_type, "upload"))
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(provider_error(res).await);
        }
        let body: UploadResponse = res.json().await?;

        Ok(UploadedObject {
            url: body.secure_url,
            public_id: body.public_id,
        })
    }

    async fn delete(
        &self,
        public_id: &str,
        resource_type: ResourceType,
    ) -> Result<(), StorageError> {
        self.check_credentials()?;

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(&[
            ("public_id", public_id),
            ("timestamp", timestamp.as_str()),
        ]);
        let params = [
            ("public_id", public_id),
            ("timestamp", timestamp.as_str()),
            ("api_key", self.config.api_key.as_str()),
            ("signature", signature.as_str()),
            ("signature_algorithm", "sha256"),
        ];

        let res = self
            .http
            .post(self.endpoint(resource_type, "destroy"))
            .form(&params)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(provider_error(res).await);
        }
        let body: DestroyResponse = res.json().await?;
        match body.result.as_str() {
            "ok" => {
                tracing::info!(public_id, "deleted Cloudinary asset");
                Ok(())
            }
            "not found" => Err(StorageError::NotFound(public_id.to_owned())),
            other => Err(StorageError::Provider {
                status: None,
                payload: serde_json::json!({ "result": other }),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Multipart, Path, State},
        routing::post,
        Form as AxumForm, Json, Router,
    };
    use serde_json::{json, Value};
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct MockCloud {
        uploaded: Arc<Mutex<Vec<String>>>,
    }

    async fn mock_upload(
        State(cloud): State<MockCloud>,
        Path((cloud_name, resource_type)): Path<(String, String)>,
        mut multipart: Multipart,
    ) -> Json<Value> {
        let mut fields = HashMap::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_owned();
            let value = field.bytes().await.unwrap();
            fields.insert(name, String::from_utf8_lossy(&value).into_owned());
        }
        let public_id =
            format!("{}/{}", fields["folder"], fields["public_id"]);
        cloud.uploaded.lock().unwrap().push(public_id.clone());

        Json(json!({
            "public_id": public_id,
            "secure_url": format!(
                "https://res.cloudinary.com/{cloud_name}/{resource_type}/upload/v1/{public_id}"
            ),
        }))
    }

    async fn mock_destroy(
        State(cloud): State<MockCloud>,
        AxumForm(params): AxumForm<HashMap<String, String>>,
    ) -> Json<Value> {
        let mut uploaded = cloud.uploaded.lock().unwrap();
        let before = uploaded.len();
        uploaded.retain(|id| id != &params["public_id"]);
        let result = if uploaded.len() < before { "ok" } else { "not found" };
        Json(json!({ "result": result }))
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(router.into_make_service())
                .await
                .unwrap();
        });
        addr
    }

    fn get_config(api_base: String) -> CloudinaryConfig {
        CloudinaryConfig {
            cloud_name: "demo".into(),
            api_key: "1234".into(),
            api_secret: "shh".into(),
            api_base,
        }
    }

    fn get_file() -> FileData {
        FileData {
            file_name: "olympic_flag.jpg".into(),
            content_type: "image/jpeg".into(),
            bytes: vec![0xff, 0xd8, 0xff, 0xe0],
        }
    }

    #[test]
    fn test_sign_params() {
        // echo -n "folder=notes_uploads&public_id=flag&timestamp=1700000000shh" | sha256sum
        assert_eq!(
            sign_params(
                &[
                    ("timestamp", "1700000000"),
                    ("public_id", "flag"),
                    ("folder", "notes_uploads"),
                    ("upload_preset", ""),
                ],
                "shh"
            ),
            "dd1f0b8c4523dec74b035b37321ae36003d2671665af3a0959cd28c0ddbb0729"
        );
    }

    #[tokio::test]
    async fn test_upload_without_credentials_fails_fast() {
        let storage = CloudinaryStorage::new(CloudinaryConfig {
            api_base: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        let options = UploadOptions::for_attachment(&get_file(), ResourceType::Image);

        let err = storage.upload(get_file(), &options).await.unwrap_err();
        assert!(matches!(err, StorageError::Authentication(_)));
        let err = storage
            .delete("notes_uploads/flag", ResourceType::Image)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_upload_then_delete() {
        let router = Router::new()
            .route("/v1_1/:cloud/:resource_type/upload", post(mock_upload))
            .route("/v1_1/:cloud/:resource_type/destroy", post(mock_destroy))
            .with_state(MockCloud::default());
        let addr = serve(router).await;
        let storage = CloudinaryStorage::new(get_config(format!("http://{addr}")));

        let options = UploadOptions {
            folder: "notes_uploads".into(),
            public_id: Some("olympic_flag".into()),
            resource_type: ResourceType::Image,
        };
        let uploaded = storage.upload(get_file(), &options).await.unwrap();
        assert!(uploaded.url.starts_with("https://res.cloudinary.com/demo/"));
        assert_eq!(uploaded.public_id, "notes_uploads/olympic_flag");

        storage
            .delete(&uploaded.public_id, ResourceType::Image)
            .await
            .unwrap();
        let err = storage
            .delete(&uploaded.public_id, ResourceType::Image)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_authentication_errors() {
        let router = Router::new().route(
            "/v1_1/:cloud/:resource_type/upload",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": { "message": "Invalid Signature" } })),
                )
            }),
        );
        let addr = serve(router).await;
        let storage = CloudinaryStorage::new(get_config(format!("http://{addr}")));
        let options = UploadOptions::for_attachment(&get_file(), ResourceType::Image);

        let err = storage.upload(get_file(), &options).await.unwrap_err();
        match err {
            StorageError::Authentication(payload) => {
                assert!(payload.contains("Invalid Signature"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_provider_errors_carry_payload() {
        let router = Router::new().route(
            "/v1_1/:cloud/:resource_type/upload",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(json!({ "error": { "message": "File size too large" } })),
                )
            }),
        );
        let addr = serve(router).await;
        let storage = CloudinaryStorage::new(get_config(format!("http://{addr}")));
        let options = UploadOptions::for_attachment(&get_file(), ResourceType::Image);

        match storage.upload(get_file(), &options).await.unwrap_err() {
            StorageError::Provider { status, payload } => {
                assert_eq!(status, Some(400));
                assert_eq!(payload["error"]["message"], "File size too large");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
