use super::storage::StorageError;
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::ValidationErrors;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { field: String, message: String },
    #[error("Cast to ObjectId failed for value \"{value}\" at path \"{path}\"")]
    Cast { path: &'static str, value: String },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Not authorized, {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_owned(),
            message: message.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::Cast { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Storage(StorageError::Authentication(_)) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Storage(StorageError::InvalidFile(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Validation { field, message } => {
                json!({ "message": message, "field": field })
            }
            Self::Cast { path, .. } => {
                json!({ "message": self.to_string(), "field": path })
            }
            // Internal details stay in the log.
            Self::Internal(_) => json!({
                "message": "An unexpected error occurred on the server."
            }),
            _ => json!({ "message": self.to_string() }),
        };
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        } else {
            tracing::warn!(%status, error = %self, "request rejected");
        }

        (status, Json(body)).into_response()
    }
}

// Documents that fail to (de)serialize are never the caller's fault.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

// Extractor rejections keep axum's message but use the JSON error body.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation("body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation("query", rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::validation("path", rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::validation("file", rejection.body_text())
    }
}

/// Reports the first offending field, ordered by field name so the same
/// input always yields the same message.
impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by_key(|(field, _)| *field);
        match fields.first() {
            Some((field, errs)) => {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Path `{field}` is invalid."));
                Self::validation(field, message)
            }
            None => Self::validation("document", errors.to_string()),
        }
    }
}
