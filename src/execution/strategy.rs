use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::{HostApi, RemoteSubmitter};

/// Configured strategy, before collaborators are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Direct,
    LocalApi,
    RemoteSubmit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StrategyKind::Direct => "direct",
            StrategyKind::LocalApi => "local_api",
            StrategyKind::RemoteSubmit => "remote_submit",
        };
        f.write_str(label)
    }
}

/// How the solver is driven for one work unit. Bound once per unit and never
/// switched between attempts.
pub enum ExecutionStrategy {
    /// Spawn `solver_binary -i <input> [flags]` and monitor its stdout.
    Direct {
        solver_binary: PathBuf,
        flags: Vec<String>,
    },
    /// Run the solver in-process through the host application.
    LocalApi(Box<dyn HostApi>),
    /// Hand the input to a batch service. Without `wait` the engine returns
    /// as soon as the job is accepted.
    RemoteSubmit {
        submitter: Box<dyn RemoteSubmitter>,
        wait: bool,
        poll_interval: Duration,
    },
}

impl ExecutionStrategy {
    pub fn direct(solver_binary: impl Into<PathBuf>, flags: Vec<String>) -> Self {
        ExecutionStrategy::Direct {
            solver_binary: solver_binary.into(),
            flags,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ExecutionStrategy::Direct { .. } => StrategyKind::Direct,
            ExecutionStrategy::LocalApi(_) => StrategyKind::LocalApi,
            ExecutionStrategy::RemoteSubmit { .. } => StrategyKind::RemoteSubmit,
        }
    }
}

impl fmt::Debug for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::Direct {
                solver_binary,
                flags,
            } => f
                .debug_struct("Direct")
                .field("solver_binary", solver_binary)
                .field("flags", flags)
                .finish(),
            ExecutionStrategy::LocalApi(_) => f.write_str("LocalApi"),
            ExecutionStrategy::RemoteSubmit {
                wait,
                poll_interval,
                ..
            } => f
                .debug_struct("RemoteSubmit")
                .field("wait", wait)
                .field("poll_interval", poll_interval)
                .finish(),
        }
    }
}
