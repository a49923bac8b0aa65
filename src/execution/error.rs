use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that end an execution of a work unit.
///
/// Transient solver failures never appear here: they are absorbed by the
/// retry loop. Only terminal outcomes reach the caller.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Cancellation was requested. The process has already been terminated.
    #[error("execution cancelled")]
    Cancelled,

    /// The solver reported an out-of-memory condition. Never retried.
    #[error("solver ran out of memory: {message}")]
    OutOfMemory { message: String },

    /// The solver exited successfully but produced no result object.
    #[error("results '{name}' not found in {} after reload", project.display())]
    ResultsNotFound { name: String, project: PathBuf },

    /// The solver process could not be spawned.
    #[error("failed to start '{command}': {source}")]
    StartFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// An opt-in retry cap was reached.
    #[error("giving up after {attempts} attempts (last exit code {last_exit_code:?})")]
    RetriesExhausted {
        attempts: u32,
        last_exit_code: Option<i32>,
    },

    /// A pluggable strategy (host API, remote submitter) failed terminally.
    #[error("strategy error: {0}")]
    Strategy(String),

    /// The project document could not be closed or reopened.
    #[error("project document error: {0}")]
    Document(String),

    /// IO error outside of an attempt.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ExecutionError {
    /// Whether this error ends the whole sweep rather than one work unit.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

/// Result type for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguishable() {
        assert!(ExecutionError::Cancelled.is_cancellation());
        let oom = ExecutionError::OutOfMemory {
            message: "out of memory".to_string(),
        };
        assert!(!oom.is_cancellation());
    }

    #[test]
    fn test_results_not_found_message_names_object() {
        let err = ExecutionError::ResultsNotFound {
            name: "Overall Field".to_string(),
            project: PathBuf::from("/tmp/unit/project.smash"),
        };
        let message = err.to_string();
        assert!(message.contains("Overall Field"));
        assert!(message.contains("project.smash"));
    }
}
