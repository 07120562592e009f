use std::fmt;
use thiserror::Error;

use super::artifact::ResultView;
use super::error::{FailureKind, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Selecting,
    Submitting,
    AwaitingExternalProcessing,
    Presenting,
    Success,
    Failure,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Success | Stage::Failure)
    }

    /// Edges of the upload → wait → result flow. `Idle` may jump straight
    /// to the waiting or result stage, which is what a direct navigation or
    /// a page refresh looks like.
    pub fn can_transition_to(&self, to: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, to),
            (Idle, Selecting)
                | (Idle, AwaitingExternalProcessing)
                | (Idle, Presenting)
                | (Selecting, Selecting)
                | (Selecting, Submitting)
                | (Submitting, AwaitingExternalProcessing)
                | (Submitting, Failure)
                | (AwaitingExternalProcessing, Presenting)
                | (AwaitingExternalProcessing, Failure)
                | (Presenting, Success)
                | (Presenting, Failure)
                | (Success, Selecting)
                | (Success, Presenting)
                | (Success, Idle)
                | (Failure, Selecting)
                | (Failure, Submitting)
                | (Failure, AwaitingExternalProcessing)
                | (Failure, Idle)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::Selecting => "Selecting",
            Stage::Submitting => "Submitting",
            Stage::AwaitingExternalProcessing => "AwaitingExternalProcessing",
            Stage::Presenting => "Presenting",
            Stage::Success => "Success",
            Stage::Failure => "Failure",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// What a retry re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Upload the cached file again.
    Submit,
    /// Call the processor again with the stored task.
    Process,
    /// Run upload, processing and presentation from the top.
    Pipeline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Stage that failed.
    pub stage: Stage,
    pub retry: Option<RetryAction>,
}

impl Failure {
    pub fn from_error(stage: Stage, error: &PipelineError, retry: Option<RetryAction>) -> Self {
        Self {
            kind: error.kind(),
            message: error.user_message(),
            stage,
            retry,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// A failure can always be abandoned in favour of picking a new file.
    pub fn can_restart(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Selecting {
        file: Option<FileSummary>,
        /// Inline message when confirming without a file.
        validation: Option<String>,
    },
    Submitting {
        file_name: String,
    },
    AwaitingExternalProcessing {
        task_id: Option<String>,
        status_message: String,
    },
    Presenting,
    Success(ResultView),
    Failure(Failure),
}

impl PipelineState {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineState::Idle => Stage::Idle,
            PipelineState::Selecting { .. } => Stage::Selecting,
            PipelineState::Submitting { .. } => Stage::Submitting,
            PipelineState::AwaitingExternalProcessing { .. } => Stage::AwaitingExternalProcessing,
            PipelineState::Presenting => Stage::Presenting,
            PipelineState::Success(_) => Stage::Success,
            PipelineState::Failure(_) => Stage::Failure,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PipelineState::Failure(f) => Some(f),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&ResultView> {
        match self {
            PipelineState::Success(view) => Some(view),
            _ => None,
        }
    }
}

/// Holds the current state and rejects moves the flow does not allow.
#[derive(Debug)]
pub struct StateMachine {
    state: PipelineState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    pub fn transition(&mut self, next: PipelineState) -> Result<&PipelineState, InvalidTransition> {
        let from = self.state.stage();
        let to = next.stage();
        if !from.can_transition_to(to) {
            tracing::warn!("Rejected transition {} -> {}", from, to);
            return Err(InvalidTransition { from, to });
        }

        tracing::debug!("Pipeline {} -> {}", from, to);
        self.state = next;
        Ok(&self.state)
    }

    /// Navigation back to the start, allowed from anywhere.
    pub fn restart(&mut self) -> &PipelineState {
        tracing::debug!("Pipeline {} -> Selecting (restart)", self.state.stage());
        self.state = PipelineState::Selecting {
            file: None,
            validation: None,
        };
        &self.state
    }

    /// Updates the payload of the current state without changing stage.
    pub fn update(&mut self, next: PipelineState) -> Result<&PipelineState, InvalidTransition> {
        let from = self.state.stage();
        let to = next.stage();
        if from != to {
            return Err(InvalidTransition { from, to });
        }
        self.state = next;
        Ok(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [
            Stage::Idle,
            Stage::Selecting,
            Stage::Submitting,
            Stage::AwaitingExternalProcessing,
            Stage::Presenting,
            Stage::Success,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_always_leads_back_to_selecting() {
        for stage in [
            Stage::Submitting,
            Stage::AwaitingExternalProcessing,
            Stage::Presenting,
        ] {
            assert!(stage.can_transition_to(Stage::Failure));
        }
        assert!(Stage::Failure.can_transition_to(Stage::Selecting));
    }

    #[test]
    fn test_rejected_edges() {
        assert!(!Stage::Idle.can_transition_to(Stage::Submitting));
        assert!(!Stage::Selecting.can_transition_to(Stage::Presenting));
        assert!(!Stage::Submitting.can_transition_to(Stage::Success));
        assert!(!Stage::Success.can_transition_to(Stage::Failure));
    }

    #[test]
    fn test_state_machine_rejects_and_keeps_state() {
        let mut machine = StateMachine::new();
        let err = machine
            .transition(PipelineState::Submitting {
                file_name: "photo.png".to_string(),
            })
            .unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: Stage::Idle,
                to: Stage::Submitting
            }
        );
        assert_eq!(machine.stage(), Stage::Idle);
    }

    #[test]
    fn test_update_keeps_stage() {
        let mut machine = StateMachine::new();
        machine
            .transition(PipelineState::Selecting {
                file: None,
                validation: None,
            })
            .unwrap();
        machine
            .update(PipelineState::Selecting {
                file: None,
                validation: Some("Please select a file.".to_string()),
            })
            .unwrap();
        assert!(machine.update(PipelineState::Idle).is_err());
    }
}
