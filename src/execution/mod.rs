//! Solver execution: process ownership, output parsing, retries and the
//! per-work-unit engine that composes them.

pub mod cancel;
pub mod engine;
pub mod error;
pub mod keep_awake;
pub mod parser;
pub mod post_sim;
pub mod process;
pub mod registry;
pub mod retry;
pub mod strategy;
pub mod watchdog;

pub use cancel::CancellationToken;
pub use engine::{
    EngineSettings, ExecutionEngine, ExecutionOutcome, ExecutionReport, ExecutionRequest,
    DEFAULT_RESULT_NAME,
};
pub use error::{ExecutionError, ExecutionResult};
pub use keep_awake::{CommandKeepAwake, KeepAwake, KeepAwakeHandler, NoKeepAwake};
pub use parser::{format_time, OutputParser, ParsedLine, ProgressInfo};
pub use post_sim::PostSimulationHandler;
pub use process::{ProcessManager, SolverCommand};
pub use registry::ProcessRegistry;
pub use retry::{RetryDecision, RetryHandler, RetryPolicy};
pub use strategy::{ExecutionStrategy, StrategyKind};
pub use watchdog::{AttemptWatchdog, WatchdogConfig, WatchdogTrip};
