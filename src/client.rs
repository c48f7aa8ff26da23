//! HTTP client for the notes API, as used by the web UI.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;

pub const DEFAULT_API_URL: &str = "http://localhost:5001/api";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("server responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not parse response: {0}")]
    Parse(#[source] reqwest::Error),
}

/// A note as the listing returns it. Fields besides `_id` and `title` are
/// kept verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteListing {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct NotesClient {
    api_url: String,
    http: reqwest::Client,
}

impl NotesClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// `API_URL`, then `REACT_APP_API_URL`, then [`DEFAULT_API_URL`].
    pub fn from_env() -> Self {
        let api_url = env::var("API_URL")
            .or_else(|_| env::var("REACT_APP_API_URL"))
            .unwrap_or_else(|_| DEFAULT_API_URL.to_owned());
        Self::new(api_url)
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// One unauthenticated `GET {api_url}/notes`. No retries and no
    /// pagination; a non-2xx status is an error, never an empty list.
    pub async fn fetch_notes(&self) -> Result<Vec<NoteListing>, ClientError> {
        let res = self
            .http
            .get(format!("{}/notes", self.api_url))
            .send()
            .await
            .map_err(ClientError::Network)?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        res.json().await.map_err(ClientError::Parse)
    }
}
