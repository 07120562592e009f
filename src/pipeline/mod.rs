//! Client side of the upload → wait → result flow.
//!
//! A [`Pipeline`] plays the three stages a user walks through: it uploads
//! the selected photo to the receiver, asks the external processor for an
//! artifact, and presents the result. Stages never call each other directly;
//! each one reads what it needs from the [`HandoffStore`] written by the
//! previous stage, so any stage can be entered on its own (a refresh or a
//! direct navigation) and fail cleanly when its input is missing.

pub mod artifact;
pub mod client;
pub mod error;
pub mod handoff;
pub mod processor;
pub mod selection;
pub mod state;

pub use artifact::{ArtifactKind, ArtifactPayload, Blob, BlobRegistry, ResultView};
pub use client::ReceiverClient;
pub use error::{FailureKind, PipelineError};
pub use handoff::{HandoffKey, HandoffStore, ResultHandoff, SelectionHandoff, UploadHandoff};
pub use processor::{DirectProcessor, ExternalProcessor, PollingProcessor};
pub use selection::SelectedFile;
pub use state::{Failure, FileSummary, InvalidTransition, PipelineState, RetryAction, Stage};

use crate::config::{PipelineConfig, ProcessorMode};
use crate::models::{ProcessRequest, UploadResponse};
use error::{HANDOFF_MISSING, NO_FILE_SELECTED, RESULT_NOT_FOUND};
use state::StateMachine;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// Stops in-flight processor calls of the pipeline it was taken from.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    machine: StateMachine,
    handoff: HandoffStore,
    blobs: BlobRegistry,
    receiver: ReceiverClient,
    processor: Arc<dyn ExternalProcessor>,
    selected: Option<SelectedFile>,
    /// Blob behind the last presented result, owned until released
    presented_blob: Option<String>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Pipeline {
    /// Builds the receiver client and the processor named by
    /// `config.processor_mode`.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("modelgen-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let processor = build_processor(&config, http.clone())?;
        let receiver = ReceiverClient::new(http, &config.receiver_url)?;
        Ok(Self::with_parts(
            config,
            receiver,
            processor,
            HandoffStore::new(),
            BlobRegistry::new(),
        ))
    }

    pub fn with_parts(
        config: PipelineConfig,
        receiver: ReceiverClient,
        processor: Arc<dyn ExternalProcessor>,
        handoff: HandoffStore,
        blobs: BlobRegistry,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            machine: StateMachine::new(),
            handoff,
            blobs,
            receiver,
            processor,
            selected: None,
            presented_blob: None,
            cancel: Arc::new(cancel),
        }
    }

    pub fn state(&self) -> &PipelineState {
        self.machine.state()
    }

    pub fn stage(&self) -> Stage {
        self.machine.stage()
    }

    pub fn handoff(&self) -> &HandoffStore {
        &self.handoff
    }

    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Picks (or clears) the file to upload. No network activity.
    pub fn select_file(
        &mut self,
        file: Option<SelectedFile>,
    ) -> Result<&PipelineState, InvalidTransition> {
        self.release_result();
        let summary = file.as_ref().map(|f| FileSummary {
            name: f.name.clone(),
            content_type: f.content_type.clone(),
            size: f.bytes.len(),
        });
        self.machine.transition(PipelineState::Selecting {
            file: summary,
            validation: None,
        })?;
        self.selected = file;
        Ok(self.machine.state())
    }

    /// Confirms the selection and uploads it. Without a selected file the
    /// pipeline stays in `Selecting` with an inline validation message.
    pub async fn submit(&mut self) -> Result<&PipelineState, InvalidTransition> {
        let stage = self.stage();
        if stage != Stage::Selecting {
            return Err(InvalidTransition {
                from: stage,
                to: Stage::Submitting,
            });
        }

        let Some(file) = &self.selected else {
            return self.machine.update(PipelineState::Selecting {
                file: None,
                validation: Some(NO_FILE_SELECTED.to_string()),
            });
        };

        // Both records share the file name key
        self.handoff.discard::<UploadHandoff>();
        self.handoff.put(&file.to_handoff());
        self.upload_cached().await
    }

    /// Runs every remaining stage from the current one until the pipeline
    /// reaches `Success` or `Failure`.
    pub async fn run(&mut self) -> Result<&PipelineState, InvalidTransition> {
        self.cancel.send_replace(false);
        if self.stage() == Stage::Selecting {
            self.submit().await?;
        }
        self.advance().await
    }

    /// Entry of the waiting stage: reads the upload hand-off and asks the
    /// processor for an artifact.
    pub async fn await_processing(&mut self) -> Result<&PipelineState, InvalidTransition> {
        self.cancel.send_replace(false);
        self.wait_for_artifact().await
    }

    async fn wait_for_artifact(&mut self) -> Result<&PipelineState, InvalidTransition> {
        let entering = PipelineState::AwaitingExternalProcessing {
            task_id: None,
            status_message: "Preparing the uploaded file...".to_string(),
        };
        if self.stage() == Stage::AwaitingExternalProcessing {
            self.machine.update(entering)?;
        } else {
            self.machine.transition(entering)?;
        }

        let Some(upload) = self.handoff.peek::<UploadHandoff>() else {
            let missing = self.handoff.missing::<UploadHandoff>();
            warn!("Upload hand-off incomplete, missing: {:?}", missing);
            return self.fail(
                Stage::AwaitingExternalProcessing,
                &PipelineError::Validation(HANDOFF_MISSING.to_string()),
                None,
            );
        };

        self.machine.update(PipelineState::AwaitingExternalProcessing {
            task_id: Some(upload.task_id.clone()),
            status_message: format!("Processing {}...", upload.original_file_name),
        })?;

        match self.process(&upload).await {
            Ok(record) => {
                self.handoff.put(&record);
                self.handoff.discard::<UploadHandoff>();
                info!("📬 Artifact for task {} is ready", record.task_id);
                self.machine.transition(PipelineState::Presenting)
            }
            Err(e) => self.fail(
                Stage::AwaitingExternalProcessing,
                &e,
                Some(RetryAction::Process),
            ),
        }
    }

    /// Entry of the result stage: takes the result hand-off exactly once.
    /// A result presented earlier is released first.
    pub fn present(&mut self) -> Result<&PipelineState, InvalidTransition> {
        self.release_result();
        if self.stage() != Stage::Presenting {
            self.machine.transition(PipelineState::Presenting)?;
        }

        let Some(record) = self.handoff.take::<ResultHandoff>() else {
            self.handoff.discard::<ResultHandoff>();
            return self.fail(
                Stage::Presenting,
                &PipelineError::DataLoss(RESULT_NOT_FOUND.to_string()),
                Some(RetryAction::Pipeline),
            );
        };

        let content_type = if record.content_type.is_empty() {
            self.blobs
                .resolve(&record.artifact_url)
                .map(|b| b.content_type)
                .unwrap_or_default()
        } else {
            record.content_type
        };

        let view = ResultView::new(
            &record.task_id,
            &record.artifact_url,
            &content_type,
            &self.config.viewer_base_url,
        );
        info!("🎉 Presenting {:?} artifact for task {}", view.kind, view.task_id);
        if artifact::is_blob_url(&view.location) {
            self.presented_blob = Some(view.location.clone());
        }
        self.machine.transition(PipelineState::Success(view))
    }

    /// Re-enters the stage named by the current failure's retry action and
    /// carries on to a terminal state.
    pub async fn retry(&mut self) -> Result<&PipelineState, InvalidTransition> {
        let Some(failure) = self.state().failure().cloned() else {
            return Err(InvalidTransition {
                from: self.stage(),
                to: Stage::Submitting,
            });
        };

        info!("🔁 Retrying after {} failure: {}", failure.stage, failure.message);
        self.cancel.send_replace(false);
        match failure.retry {
            Some(RetryAction::Submit) => {
                self.upload_cached().await?;
            }
            Some(RetryAction::Process) => {
                self.wait_for_artifact().await?;
            }
            Some(RetryAction::Pipeline) => {
                if let Some(file) = &self.selected {
                    self.handoff.discard::<UploadHandoff>();
                    self.handoff.put(&file.to_handoff());
                }
                self.upload_cached().await?;
            }
            None => {
                return Err(InvalidTransition {
                    from: Stage::Failure,
                    to: failure.stage,
                });
            }
        }
        self.advance().await
    }

    /// Abandons the current run: cancels processor calls, clears the session
    /// and goes back to picking a file.
    pub fn back_to_start(&mut self) -> &PipelineState {
        self.cancel.send_replace(true);
        self.release_result();
        if let Some(pending) = self.handoff.peek::<ResultHandoff>() {
            if artifact::is_blob_url(&pending.artifact_url) {
                self.blobs.revoke(&pending.artifact_url);
            }
        }
        self.handoff.clear();
        self.selected = None;
        self.machine.restart()
    }

    /// Bytes of the presented artifact when it was downloaded into this
    /// session rather than referenced by URL.
    pub fn artifact_blob(&self) -> Option<Blob> {
        let view = self.state().result()?;
        if artifact::is_blob_url(&view.location) {
            self.blobs.resolve(&view.location)
        } else {
            None
        }
    }

    /// Frees the downloaded bytes of the presented artifact, if any. Works
    /// after the pipeline has left `Success`.
    pub fn release_result(&mut self) -> bool {
        match self.presented_blob.take() {
            Some(url) => self.blobs.revoke(&url),
            None => false,
        }
    }

    async fn advance(&mut self) -> Result<&PipelineState, InvalidTransition> {
        loop {
            match self.stage() {
                Stage::AwaitingExternalProcessing => {
                    self.wait_for_artifact().await?;
                }
                Stage::Presenting => {
                    self.present()?;
                }
                _ => return Ok(self.machine.state()),
            }
        }
    }

    /// Submitting stage proper: uploads the file cached in the hand-off
    /// store (falling back to the in-memory selection) and records the task.
    async fn upload_cached(&mut self) -> Result<&PipelineState, InvalidTransition> {
        let cached = self.handoff.peek::<SelectionHandoff>();
        let file_name = cached
            .as_ref()
            .map(|c| c.file_name.clone())
            .or_else(|| self.selected.as_ref().map(|f| f.name.clone()))
            .unwrap_or_default();
        self.machine
            .transition(PipelineState::Submitting { file_name })?;

        let file = match cached {
            Some(record) => SelectedFile::from_handoff(&record),
            None => self
                .selected
                .clone()
                .ok_or_else(|| PipelineError::Validation(NO_FILE_SELECTED.to_string())),
        };
        let file = match file {
            Ok(file) => file,
            Err(e) => return self.fail(Stage::Submitting, &e, None),
        };

        match self.receiver.upload(&file).await {
            Ok(UploadResponse {
                task_id,
                file_extension,
            }) => {
                info!("✅ Uploaded {} as task {}", file.name, task_id);
                self.handoff.discard::<SelectionHandoff>();
                self.handoff.put(&UploadHandoff {
                    task_id: task_id.clone(),
                    file_extension,
                    original_file_name: file.name,
                });
                self.machine
                    .transition(PipelineState::AwaitingExternalProcessing {
                        task_id: Some(task_id),
                        status_message: "Upload complete, waiting for processing...".to_string(),
                    })
            }
            Err(e) => self.fail(Stage::Submitting, &e, Some(RetryAction::Submit)),
        }
    }

    async fn process(&self, upload: &UploadHandoff) -> Result<ResultHandoff, PipelineError> {
        let mut cancel = self.cancel.subscribe();

        if !self.config.settle_delay.is_zero() {
            tokio::select! {
                _ = processor::wait_cancelled(&mut cancel) => return Err(PipelineError::Cancelled),
                _ = sleep(self.config.settle_delay) => {}
            }
        }

        let request = ProcessRequest {
            task_id: upload.task_id.clone(),
            file_extension: upload.file_extension.clone(),
        };
        let payload = self.processor.process(&request, cancel).await?;

        let (artifact_url, content_type) = match payload {
            ArtifactPayload::Bytes {
                bytes,
                content_type,
            } => {
                let content_type = match content_type {
                    Some(ct) if !ct.is_empty() && ct != mime::APPLICATION_OCTET_STREAM.as_ref() => ct,
                    _ => artifact::sniff_content_type(&bytes)
                        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string()),
                };
                (self.blobs.create(bytes, content_type.clone()), content_type)
            }
            ArtifactPayload::Remote { url } => (url, String::new()),
        };

        Ok(ResultHandoff {
            artifact_url,
            task_id: upload.task_id.clone(),
            content_type,
        })
    }

    fn fail(
        &mut self,
        stage: Stage,
        error: &PipelineError,
        retry: Option<RetryAction>,
    ) -> Result<&PipelineState, InvalidTransition> {
        // Validation failures mean the preceding step has to be redone
        let retry = match error {
            PipelineError::Validation(_) => None,
            _ => retry,
        };
        warn!("❌ {} failed ({:?}): {}", stage, error.kind(), error);
        self.machine
            .transition(PipelineState::Failure(Failure::from_error(stage, error, retry)))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

pub fn build_processor(
    config: &PipelineConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn ExternalProcessor>, PipelineError> {
    let require = |value: &Option<String>, name: &str| {
        value.clone().filter(|v| !v.is_empty()).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "{} is required for {:?} processing",
                name, config.processor_mode
            ))
        })
    };

    Ok(match config.processor_mode {
        ProcessorMode::Direct => Arc::new(DirectProcessor::new(
            http,
            require(&config.processor_url, "PROCESSOR_URL")?,
        )),
        ProcessorMode::Polling => Arc::new(PollingProcessor::new(
            http,
            config.processor_url.clone().filter(|v| !v.is_empty()),
            require(&config.status_url, "PROCESSOR_STATUS_URL")?,
            require(&config.result_url, "PROCESSOR_RESULT_URL")?,
            config.poll_interval,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_processor_requires_urls() {
        let config = PipelineConfig::default();
        assert!(matches!(
            build_processor(&config, reqwest::Client::new()),
            Err(PipelineError::Configuration(m)) if m.contains("PROCESSOR_URL")
        ));

        let config = PipelineConfig {
            processor_mode: ProcessorMode::Polling,
            status_url: Some("http://localhost:5000/status".to_string()),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            build_processor(&config, reqwest::Client::new()),
            Err(PipelineError::Configuration(m)) if m.contains("PROCESSOR_RESULT_URL")
        ));
    }

    #[test]
    fn test_cancel_handle_signals_pipeline() {
        let config = PipelineConfig {
            processor_url: Some("http://localhost:9/process".to_string()),
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::from_config(config).unwrap();
        let handle = pipeline.cancel_handle();
        let mut rx = pipeline.cancel.subscribe();
        handle.cancel();
        assert!(*rx.borrow_and_update());
    }
}
