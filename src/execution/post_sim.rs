use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::error::{ExecutionError, ExecutionResult};
use crate::collaborators::ProjectDocument;

/// Verifies that a successful solver run actually left results behind.
///
/// The solver writes its result container asynchronously with respect to its
/// exit, so the handler waits a fixed settle time, reloads the project
/// document and checks for the expected result object. A missing object is a
/// structural problem and is never retried.
#[derive(Debug, Clone)]
pub struct PostSimulationHandler {
    settle_time: Duration,
    result_name: String,
}

impl PostSimulationHandler {
    pub fn new(settle_time: Duration, result_name: impl Into<String>) -> Self {
        Self {
            settle_time,
            result_name: result_name.into(),
        }
    }

    pub fn result_name(&self) -> &str {
        &self.result_name
    }

    /// Settle, close, reopen and verify.
    pub fn verify(
        &self,
        document: &mut dyn ProjectDocument,
        project_path: &Path,
    ) -> ExecutionResult<()> {
        if !self.settle_time.is_zero() {
            debug!(settle_ms = self.settle_time.as_millis() as u64, "waiting for result flush");
            thread::sleep(self.settle_time);
        }

        document
            .close()
            .map_err(|e| ExecutionError::Document(e.to_string()))?;
        document
            .open(project_path)
            .map_err(|e| ExecutionError::Document(e.to_string()))?;

        if !document.has_result(&self.result_name) {
            return Err(ExecutionError::ResultsNotFound {
                name: self.result_name.clone(),
                project: project_path.to_path_buf(),
            });
        }

        info!(result = %self.result_name, project = %project_path.display(), "results verified");
        Ok(())
    }
}
