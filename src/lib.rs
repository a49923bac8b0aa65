//! Resilient sweep runner for long external solver invocations.
//!
//! A sweep enumerates work units from a study configuration. Each unit passes
//! through setup, run and extract; a content-hash checkpoint per unit decides
//! which phases are still valid on resume, the execution engine retries
//! transient solver failures, and a weighted progress estimator turns phase
//! timings into an ETA that improves across sessions.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod execution;
pub mod hooks;
pub mod pipeline;
pub mod progress;
pub mod telemetry;
pub mod ui;
pub mod work_unit;

pub use checkpoint::{CheckpointError, CheckpointResult, CheckpointStore, PhaseValidity};
pub use crate::config::{ConfigError, ConfigResult, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use execution::{
    CancellationToken, ExecutionEngine, ExecutionError, ExecutionResult, ExecutionStrategy,
};
pub use pipeline::{Collaborators, Pipeline, SweepSummary, UnitOutcome, UnitReport};
pub use progress::{Phase, ProgressEstimator};
pub use telemetry::{Severity, TelemetrySink};
pub use work_unit::{SweepPlan, WorkUnit};
