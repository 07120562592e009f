use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ErrorResponse, UploadResponse};
use crate::services::storage::StorageError;
use crate::utils::naming::UNNAMED_FILE;
use axum::{
    Json,
    extract::{Multipart, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::io;
use tokio_util::io::StreamReader;

/// Multipart field that carries the photo.
pub const FILE_FIELD: &str = "file";

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = String, description = "Multipart form with a single `file` field", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "File stored", body = UploadResponse),
        (status = 400, description = "No file uploaded", body = ErrorResponse),
        (status = 413, description = "Body too large", body = ErrorResponse),
        (status = 500, description = "Storage write failed", body = ErrorResponse),
        (status = 503, description = "Storage not configured", body = ErrorResponse)
    ),
    tag = "upload"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_file_name = field
            .file_name()
            .filter(|n| !n.is_empty())
            .unwrap_or(UNNAMED_FILE)
            .to_string();
        let content_type = field.content_type().map(|s| s.to_string());

        let body = field.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                io::Error::new(io::ErrorKind::FileTooLarge, e.body_text())
            } else {
                io::Error::other(e.body_text())
            }
        });
        let reader = StreamReader::new(body);

        let task = state
            .upload_service
            .accept(&original_file_name, content_type.as_deref(), Box::new(reader))
            .await
            .map_err(|e| match e {
                StorageError::Io(err) if err.kind() == io::ErrorKind::FileTooLarge => {
                    AppError::PayloadTooLarge(
                        "Request body exceeds the maximum allowed limit".to_string(),
                    )
                }
                other => AppError::Storage(other),
            })?;

        // Drain the rest so the client sees a clean response
        while let Ok(Some(_)) = multipart.next_field().await {}

        return Ok(Json(UploadResponse::from(&task)));
    }

    tracing::warn!("Upload request without a '{}' field", FILE_FIELD);
    Err(AppError::BadRequest("No file uploaded.".to_string()))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    let err_msg = e.body_text();
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE || err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(err_msg)
    }
}

#[utoipa::path(
    options,
    path = "/upload",
    responses(
        (status = 204, description = "CORS preflight accepted")
    ),
    tag = "upload"
)]
pub async fn upload_preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}
