use std::io;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::collaborators::CollaboratorError;
use crate::config::ConfigError;
use crate::execution::ExecutionError;
use crate::progress::{Phase, ProgressError};

/// Terminal outcome of a work unit, or of the sweep itself.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A phase must run but one of its upstream phases is disabled and has no
    /// valid checkpoint.
    #[error("{unit}: {phase} needs {missing}, which is disabled and not checkpointed")]
    MissingPrerequisite {
        unit: String,
        phase: Phase,
        missing: Phase,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Execution(err) if err.is_cancellation())
    }

    /// Whether the error ends only the current work unit, letting the sweep
    /// advance. Cancellation, a solver that cannot be started and
    /// configuration problems end the sweep.
    pub fn is_fatal_for_unit(&self) -> bool {
        match self {
            PipelineError::Execution(err) => !matches!(
                err,
                ExecutionError::Cancelled | ExecutionError::StartFailed { .. }
            ),
            PipelineError::Checkpoint(_)
            | PipelineError::Collaborator(_)
            | PipelineError::MissingPrerequisite { .. }
            | PipelineError::Io(_) => true,
            PipelineError::Progress(_) | PipelineError::Config(_) => false,
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
