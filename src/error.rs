use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Terminal outcome of a download request, as produced by the orchestrator.
/// Every internal failure is converted into one of these before it crosses
/// back to the HTTP layer.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),

    /// Extraction failed with signals of an expired or invalid session and
    /// the single refresh-and-retry cycle did not recover it.
    #[error("{0}")]
    Auth(String),

    /// The credential refresh itself could not establish a session.
    #[error("credential refresh failed: {refresh}; original download error: {download}")]
    Refresh { refresh: String, download: String },

    /// The extractor claimed success but no matching file exists on disk.
    #[error("extraction reported success but no output file was found for request {0}")]
    OutputMissing(Uuid),

    #[error("{0}")]
    Transient(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub hint: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            hint: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            hint: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
            hint: None,
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::Validation(message) => Self::bad_request(message),
            DownloadError::Auth(message) => Self {
                status: StatusCode::FORBIDDEN,
                message,
                code: Some("AUTH_FAILURE"),
                hint: None,
            },
            DownloadError::Refresh { .. } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: error.to_string(),
                code: Some("REFRESH_FAILURE"),
                hint: Some(
                    "Automated login failed. Check the configured credentials and network."
                        .to_string(),
                ),
            },
            DownloadError::OutputMissing(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: error.to_string(),
                code: Some("OUTPUT_MISSING"),
                hint: None,
            },
            DownloadError::Transient(message) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            hint: self.hint,
        });

        (self.status, body).into_response()
    }
}
