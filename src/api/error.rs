use crate::error::{QueueError, UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

const INTERNAL: &str = "Internal Server Error";

impl AppError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::Upload(e) => {
                let code = e.code();
                let status = match &e {
                    UploadError::InvalidFileType { .. } | UploadError::InvalidChunk(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    UploadError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    UploadError::DescriptorMismatch(_)
                    | UploadError::AlreadyFinalized(_)
                    | UploadError::Submit(QueueError::DuplicateTask(_)) => StatusCode::CONFLICT,
                    UploadError::Submit(QueueError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
                    UploadError::MergeFailed { .. } | UploadError::Io(_) => {
                        tracing::error!("Upload error: {}", e);
                        return (StatusCode::INTERNAL_SERVER_ERROR, code, INTERNAL.to_string());
                    }
                };
                (status, code, e.to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    INTERNAL.to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    INTERNAL.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}
