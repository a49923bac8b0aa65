//! Content-hash checkpoints deciding which phases of a work unit can be
//! skipped on resume.

pub mod artifact;
pub mod canonical;
pub mod record;
pub mod snapshot;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use artifact::{ArtifactState, HDF5_SIGNATURE};
pub use canonical::{canonical_json, digest};
pub use record::{CheckpointRecord, CHECKPOINT_SCHEMA_VERSION};
pub use snapshot::{build_surgical_snapshot, SnapshotLayout};
pub use store::{ArtifactLayout, CheckpointStore, PhaseValidity};

/// Errors from checkpoint persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt project artifact {}: {reason}", path.display())]
    CorruptProject { path: PathBuf, reason: String },

    #[error("invalid artifact signature: {0}")]
    InvalidSignature(String),

    #[error("no setup checkpoint for {unit}")]
    NoSetupRecord { unit: String },

    #[error("invalid run output pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;
