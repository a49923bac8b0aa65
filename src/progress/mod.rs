//! Multi-phase weighted progress and a self-improving ETA.

pub mod estimator;
pub mod history;
pub mod phase;

use std::io;

use thiserror::Error;

pub use estimator::{ProgressEstimator, DEFAULT_ETA_SMOOTHING};
pub use history::HistoricalEstimates;
pub use phase::Phase;

/// Errors from the historical-estimate store.
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for progress persistence.
pub type ProgressResult<T> = Result<T, ProgressError>;
