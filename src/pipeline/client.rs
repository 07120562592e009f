use reqwest::{Client, StatusCode, multipart};
use serde_json::Value;
use tracing::{debug, info};

use super::error::{MISSING_TASK_INFO, PipelineError};
use super::processor::error_detail;
use super::selection::SelectedFile;
use crate::api::handlers::upload::FILE_FIELD;
use crate::models::UploadResponse;

/// Talks to the upload receiver's `POST /upload`.
#[derive(Clone)]
pub struct ReceiverClient {
    http: Client,
    upload_url: String,
}

impl ReceiverClient {
    pub fn new(http: Client, receiver_url: &str) -> Result<Self, PipelineError> {
        let invalid = |e: url::ParseError| {
            PipelineError::Configuration(format!("Invalid receiver URL '{}': {}", receiver_url, e))
        };

        let mut base = url::Url::parse(receiver_url).map_err(invalid)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let upload_url = base.join("upload").map_err(invalid)?;

        Ok(Self {
            http,
            upload_url: upload_url.to_string(),
        })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }

    pub async fn upload(&self, file: &SelectedFile) -> Result<UploadResponse, PipelineError> {
        info!("📤 Uploading {} ({} bytes)", file.name, file.bytes.len());

        let part = || multipart::Part::bytes(file.bytes.to_vec()).file_name(file.name.clone());
        let part = part()
            .mime_str(&file.content_type)
            .or_else(|_| part().mime_str(mime::APPLICATION_OCTET_STREAM.as_ref()))?;
        let form = multipart::Form::new().part(FILE_FIELD, part);

        let response = self
            .http
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            let message = format!("Upload failed (Status: {}): {}", status.as_u16(), detail);
            return Err(if status == StatusCode::SERVICE_UNAVAILABLE {
                PipelineError::Configuration(message)
            } else {
                PipelineError::Transport(message)
            });
        }

        let body: Value = response.json().await?;
        let parsed = parse_upload_response(&body)?;
        debug!(
            "Receiver accepted {} as task {}",
            file.name, parsed.task_id
        );
        Ok(parsed)
    }
}

/// `task_id` must be a non-empty string; `file_extension` must be a string
/// but may be empty for files without a dot.
fn parse_upload_response(body: &Value) -> Result<UploadResponse, PipelineError> {
    let task_id = body
        .get("task_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());
    let file_extension = body.get("file_extension").and_then(Value::as_str);

    match (task_id, file_extension) {
        (Some(task_id), Some(file_extension)) => Ok(UploadResponse {
            task_id: task_id.to_string(),
            file_extension: file_extension.to_string(),
        }),
        _ => Err(PipelineError::Transport(MISSING_TASK_INFO.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upload_url_joins_path() {
        let client = ReceiverClient::new(Client::new(), "http://localhost:3000").unwrap();
        assert_eq!(client.upload_url(), "http://localhost:3000/upload");
    }

    #[test]
    fn test_upload_url_keeps_base_path() {
        let client = ReceiverClient::new(Client::new(), "http://localhost:5000/api").unwrap();
        assert_eq!(client.upload_url(), "http://localhost:5000/api/upload");
    }

    #[test]
    fn test_invalid_receiver_url() {
        assert!(matches!(
            ReceiverClient::new(Client::new(), "::nope"),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_upload_response() {
        let parsed =
            parse_upload_response(&json!({"task_id": "abc123", "file_extension": "png"})).unwrap();
        assert_eq!(parsed.task_id, "abc123");
        assert_eq!(parsed.file_extension, "png");

        let no_ext = parse_upload_response(&json!({"task_id": "abc123", "file_extension": ""}));
        assert_eq!(no_ext.unwrap().file_extension, "");
    }

    #[test]
    fn test_parse_upload_response_missing_fields() {
        for body in [
            json!({}),
            json!({"task_id": "abc123"}),
            json!({"task_id": "", "file_extension": "png"}),
            json!({"task_id": 5, "file_extension": "png"}),
        ] {
            assert_eq!(
                parse_upload_response(&body).unwrap_err(),
                PipelineError::Transport(MISSING_TASK_INFO.to_string())
            );
        }
    }
}
