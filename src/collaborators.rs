//! Interfaces to the systems the pipeline drives but does not implement:
//! study configuration, scene construction, result extraction, the project
//! document, and the two non-subprocess solver back ends.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::execution::CancellationToken;
use crate::work_unit::WorkUnit;

/// Error reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{collaborator}: {message}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

/// Read access to the study configuration.
pub trait ConfigProvider: Send + Sync {
    /// The fully resolved configuration tree.
    fn root(&self) -> &Value;

    /// Look up a nested value by dotted path, e.g. `"simulation.grid.max_step"`.
    fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(self.root(), path)
    }
}

/// Configuration already loaded into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let root = serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(Self { root })
    }
}

impl ConfigProvider for JsonConfig {
    fn root(&self) -> &Value {
        &self.root
    }
}

/// Resolve a dotted path against an object tree. Empty path segments are not
/// allowed; numeric segments index arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| {
        if segment.is_empty() {
            return None;
        }
        match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// Builds the scene for a work unit and writes the primary project artifact.
pub trait SceneBuilder: Send {
    fn build(
        &mut self,
        unit: &WorkUnit,
        snapshot: &Value,
        project_path: &Path,
    ) -> Result<(), CollaboratorError>;
}

/// Extracts physics results once a run has been verified.
pub trait ResultsExtractor: Send {
    /// Writes the extraction artifacts into `unit_dir`.
    fn extract(
        &mut self,
        unit: &WorkUnit,
        project_path: &Path,
        unit_dir: &Path,
    ) -> Result<(), CollaboratorError>;
}

/// The project document the solver writes results into.
pub trait ProjectDocument: Send {
    fn close(&mut self) -> Result<(), CollaboratorError>;

    fn open(&mut self, project_path: &Path) -> Result<(), CollaboratorError>;

    /// Whether a result object named `name` exists in the open document.
    fn has_result(&self, name: &str) -> bool;
}

/// In-process solver invocation through the host application's API.
pub trait HostApi: Send {
    /// Run the solver for `input`. Errors carry the solver's exit code when
    /// one is known.
    fn run_solver(&mut self, input: &Path, cancel: &CancellationToken) -> Result<(), HostApiError>;
}

/// Failure of a host API invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("host API run failed (exit code {exit_code:?}): {message}")]
pub struct HostApiError {
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Status of a remotely submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteJobStatus {
    Queued,
    Running { progress_percent: Option<f64> },
    Succeeded,
    Failed { message: String },
}

/// Remote batch-submission service. The wire protocol is the implementor's
/// concern.
pub trait RemoteSubmitter: Send {
    /// Submit `input` for `unit`, returning the service's job id.
    fn submit(&mut self, unit: &WorkUnit, input: &Path) -> Result<String, CollaboratorError>;

    fn status(&mut self, job_id: &str) -> Result<RemoteJobStatus, CollaboratorError>;

    fn cancel(&mut self, job_id: &str) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_path() {
        let config = JsonConfig::new(json!({
            "simulation": {"grid": {"max_step_mm": 1.5}},
            "phantoms": ["thelonious", "eartha"]
        }));
        assert_eq!(config.lookup("simulation.grid.max_step_mm"), Some(&json!(1.5)));
        assert_eq!(config.lookup("phantoms.1"), Some(&json!("eartha")));
        assert_eq!(config.lookup("simulation.missing"), None);
        assert_eq!(config.lookup("simulation..grid"), None);
        assert_eq!(config.lookup(""), Some(config.root()));
    }

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::new("scene", "model file missing");
        assert_eq!(err.to_string(), "scene: model file missing");
    }
}
