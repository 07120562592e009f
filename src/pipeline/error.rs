use thiserror::Error;

pub const NO_FILE_SELECTED: &str = "Please select a file.";
pub const HANDOFF_MISSING: &str =
    "hand-off data missing: the upload information was not found. Please select the file again.";
pub const RESULT_NOT_FOUND: &str =
    "result data not found: nothing arrived from processing. Please generate it again.";
pub const MISSING_TASK_INFO: &str = "The upload receiver did not return task information.";
pub const UNEXPECTED_ERROR: &str = "An unexpected error occurred during processing.";

/// The four ways a stage can fail, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No file selected, or required hand-off fields absent.
    Validation,
    /// Network failure or non-2xx response.
    Transport,
    /// Receiver storage is not configured.
    Configuration,
    /// A hand-off record that should exist is gone.
    DataLoss,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    DataLoss(String),

    #[error("Processing was cancelled.")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Validation(_) => FailureKind::Validation,
            PipelineError::Transport(_) | PipelineError::Cancelled => FailureKind::Transport,
            PipelineError::Configuration(_) => FailureKind::Configuration,
            PipelineError::DataLoss(_) => FailureKind::DataLoss,
        }
    }

    /// Message surfaced to the user. Falls back to a generic sentence when
    /// the underlying error carried no text.
    pub fn user_message(&self) -> String {
        let msg = self.to_string();
        if msg.trim().is_empty() {
            UNEXPECTED_ERROR.to_string()
        } else {
            msg
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Transport(e.to_string())
    }
}
