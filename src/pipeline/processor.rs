use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, Response, header};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::artifact::ArtifactPayload;
use super::error::PipelineError;
use crate::models::{ProcessRequest, RemoteArtifact, StatusResponse};

/// Unreserved characters stay readable in a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Turns a stored upload into an artifact. Implementations must return once
/// `cancel` flips to `true` or its sender is dropped.
#[async_trait]
pub trait ExternalProcessor: Send + Sync {
    async fn process(
        &self,
        request: &ProcessRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactPayload, PipelineError>;
}

/// A single POST that answers with the artifact.
pub struct DirectProcessor {
    http: Client,
    url: String,
}

impl DirectProcessor {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ExternalProcessor for DirectProcessor {
    async fn process(
        &self,
        request: &ProcessRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactPayload, PipelineError> {
        info!("🛰️  Calling processor for task {}", request.task_id);

        let call = async {
            let response = self.http.post(&self.url).json(request).send().await?;
            let response = ensure_success(response, "Processor request failed").await?;
            read_artifact(response).await
        };

        tokio::select! {
            _ = wait_cancelled(&mut cancel) => Err(PipelineError::Cancelled),
            res = call => res,
        }
    }
}

/// Outcome of one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Done,
    Pending(String),
    Failed(String),
}

impl PollStatus {
    pub fn from_response(status: &StatusResponse) -> Self {
        match status.status.to_ascii_lowercase().as_str() {
            "done" => PollStatus::Done,
            "error" | "failed" | "failure" => PollStatus::Failed(
                status
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("Processing ended with status '{}'", status.status)),
            ),
            _ => PollStatus::Pending(status.status.clone()),
        }
    }
}

/// Optional submit, then `GET <status_url>/<task_id>` on a fixed cadence
/// until the status is terminal, then one `GET <result_url>/<task_id>`.
pub struct PollingProcessor {
    http: Client,
    submit_url: Option<String>,
    status_url: String,
    result_url: String,
    interval: Duration,
}

impl PollingProcessor {
    pub fn new(
        http: Client,
        submit_url: Option<String>,
        status_url: impl Into<String>,
        result_url: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            http,
            submit_url,
            status_url: status_url.into(),
            result_url: result_url.into(),
            interval,
        }
    }

    async fn submit(&self, request: &ProcessRequest) -> Result<(), PipelineError> {
        if let Some(url) = &self.submit_url {
            let response = self.http.post(url).json(request).send().await?;
            ensure_success(response, "Processor submission failed").await?;
            debug!("Submitted task {} to {}", request.task_id, url);
        }
        Ok(())
    }

    async fn poll_once(&self, task_id: &str) -> Result<PollStatus, PipelineError> {
        let url = join_url(&self.status_url, task_id);
        let response = self.http.get(&url).send().await?;
        let response = ensure_success(response, "Status check failed").await?;
        let status: StatusResponse = response.json().await?;
        Ok(PollStatus::from_response(&status))
    }

    async fn fetch_result(&self, task_id: &str) -> Result<ArtifactPayload, PipelineError> {
        let url = join_url(&self.result_url, task_id);
        let response = self.http.get(&url).send().await?;
        let response = ensure_success(response, "Result fetch failed").await?;
        read_artifact(response).await
    }
}

#[async_trait]
impl ExternalProcessor for PollingProcessor {
    async fn process(
        &self,
        request: &ProcessRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ArtifactPayload, PipelineError> {
        info!("🛰️  Submitting task {} for processing", request.task_id);

        tokio::select! {
            _ = wait_cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
            res = self.submit(request) => res?,
        }

        let mut polls = 0u32;
        loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => {
                    debug!("Polling for task {} cancelled after {} polls", request.task_id, polls);
                    return Err(PipelineError::Cancelled);
                }
                _ = sleep(self.interval) => {}
            }

            let status = tokio::select! {
                _ = wait_cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
                res = self.poll_once(&request.task_id) => res?,
            };
            polls += 1;

            match status {
                PollStatus::Done => {
                    info!("✅ Task {} done after {} polls", request.task_id, polls);
                    break;
                }
                PollStatus::Failed(message) => {
                    warn!("Task {} failed: {}", request.task_id, message);
                    return Err(PipelineError::Transport(message));
                }
                PollStatus::Pending(status) => {
                    debug!("Task {} is {} (poll {})", request.task_id, status, polls);
                }
            }
        }

        tokio::select! {
            _ = wait_cancelled(&mut cancel) => Err(PipelineError::Cancelled),
            res = self.fetch_result(&request.task_id) => res,
        }
    }
}

/// Resolves when cancellation was requested or nobody can request it any more.
pub async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn join_url(base: &str, task_id: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        utf8_percent_encode(task_id, PATH_SEGMENT)
    )
}

/// Passes 2xx responses through; otherwise reads the body for the most
/// specific message available.
pub(crate) async fn ensure_success(
    response: Response,
    context: &str,
) -> Result<Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = error_detail(response).await;
    Err(PipelineError::Transport(format!(
        "{} (Status: {}): {}",
        context,
        status.as_u16(),
        detail
    )))
}

/// JSON bodies yield `error`, then `message`; anything else yields its text.
pub(crate) async fn error_detail(response: Response) -> String {
    let status = response.status();
    let is_json = content_type(&response)
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    let text = response.text().await.unwrap_or_default();
    if is_json {
        let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        return ["error", "message"]
            .iter()
            .filter_map(|field| value.get(field).and_then(|v| v.as_str()))
            .find(|s| !s.is_empty())
            .unwrap_or("Unknown JSON error")
            .to_string();
    }

    if text.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        text
    }
}

async fn read_artifact(response: Response) -> Result<ArtifactPayload, PipelineError> {
    let content_type = content_type(&response);
    let bytes: Bytes = response.bytes().await?;

    if content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("application/json"))
    {
        if let Ok(remote) = serde_json::from_slice::<RemoteArtifact>(&bytes) {
            if let Some(url) = remote.location() {
                return Ok(ArtifactPayload::Remote {
                    url: url.to_string(),
                });
            }
        }
    }

    if bytes.is_empty() {
        return Err(PipelineError::Transport(
            "The processor returned an empty artifact.".to_string(),
        ));
    }

    Ok(ArtifactPayload::Bytes {
        bytes,
        content_type,
    })
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(s: &str, message: Option<&str>) -> StatusResponse {
        StatusResponse {
            status: s.to_string(),
            message: message.map(|m| m.to_string()),
        }
    }

    #[test]
    fn test_poll_status_classification() {
        assert_eq!(PollStatus::from_response(&status("done", None)), PollStatus::Done);
        assert_eq!(PollStatus::from_response(&status("DONE", None)), PollStatus::Done);
        assert_eq!(
            PollStatus::from_response(&status("pending", None)),
            PollStatus::Pending("pending".to_string())
        );
        assert_eq!(
            PollStatus::from_response(&status("error", Some("gpu exploded"))),
            PollStatus::Failed("gpu exploded".to_string())
        );
        assert!(matches!(
            PollStatus::from_response(&status("failed", None)),
            PollStatus::Failed(m) if m.contains("failed")
        ));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h/status/", "abc-123"), "http://h/status/abc-123");
        assert_eq!(join_url("http://h/result", "a/b"), "http://h/result/a%2Fb");
        assert_eq!(join_url("http://h/status", "abc123"), "http://h/status/abc123");
    }

    #[tokio::test]
    async fn test_wait_cancelled_on_signal_and_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        wait_cancelled(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_cancelled(&mut rx).await;
    }
}
