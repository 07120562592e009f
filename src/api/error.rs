use crate::models::ErrorResponse;
use crate::services::storage::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Storage(StorageError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            AppError::BadRequest(msg) | AppError::PayloadTooLarge(msg) => ErrorResponse {
                message: msg,
                error: None,
            },
            AppError::Storage(StorageError::NotConfigured(reason)) => {
                tracing::error!("Upload rejected, storage is not configured: {}", reason);
                ErrorResponse {
                    message: "Storage is not configured".to_string(),
                    error: Some(reason),
                }
            }
            AppError::Storage(e) => {
                tracing::error!("Upload failed: {}", e);
                ErrorResponse {
                    message: "Internal Server Error (API Route)".to_string(),
                    error: Some(e.to_string()),
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
