//! Pipeline configuration.
//!
//! Loaded from a TOML file with `SWEEP__`-prefixed environment overrides,
//! e.g. `SWEEP__EXECUTION__MAX_ATTEMPTS=5` or `SWEEP__SWEEP__SHARD_INDEX=1`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::{ArtifactLayout, SnapshotLayout};
use crate::execution::{EngineSettings, RetryPolicy, StrategyKind, WatchdogConfig};
use crate::progress::{Phase, DEFAULT_ETA_SMOOTHING};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "SWEEP";

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid setting '{key}': {message}")]
    Invalid { key: &'static str, message: String },

    #[error("invalid study configuration at '{key}': {message}")]
    Study { key: String, message: String },

    #[error("invalid shard {index} of {count}")]
    InvalidShard { index: usize, count: usize },
}

impl ConfigError {
    pub fn study(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Study {
            key: key.to_string(),
            message: message.into(),
        }
    }

    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the solver is invoked and how attempts are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub strategy: StrategyKind,

    /// Solver executable for the direct strategy.
    /// Default: `iSolve`
    pub solver_binary: PathBuf,

    /// Extra flags passed after `-i <input>`.
    pub solver_flags: Vec<String>,

    /// Default: 200 ms
    pub poll_interval_ms: u64,

    /// Default: 10000 ms
    pub terminate_timeout_ms: u64,

    /// Default: 10000 ms
    pub drain_timeout_ms: u64,

    /// Default: 2000 ms
    pub retry_delay_ms: u64,

    /// Default: 5000 ms
    pub settle_time_ms: u64,

    /// Default: `Overall Field`
    pub result_name: String,

    pub log_milestones: bool,

    /// Unset retries forever.
    pub max_attempts: Option<u32>,

    /// Inhibit host sleep while the solver runs.
    pub keep_awake: bool,

    /// Wait for remote jobs instead of returning after submission.
    pub remote_wait: bool,

    /// Default: 30000 ms
    pub remote_poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            strategy: StrategyKind::Direct,
            solver_binary: PathBuf::from("iSolve"),
            solver_flags: Vec::new(),
            poll_interval_ms: millis(engine.poll_interval),
            terminate_timeout_ms: millis(engine.terminate_timeout),
            drain_timeout_ms: millis(engine.drain_timeout),
            retry_delay_ms: millis(engine.retry_delay),
            settle_time_ms: millis(engine.settle_time),
            result_name: engine.result_name,
            log_milestones: engine.log_milestones,
            max_attempts: None,
            keep_awake: true,
            remote_wait: true,
            remote_poll_interval_ms: 30_000,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Where sidecar records look for artifacts and how snapshots are cut.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub artifacts: ArtifactLayout,
    pub snapshot: SnapshotLayout,
}

/// Historical estimates and ETA display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Shared estimates file. Defaults to `<results_root>/sweep_history.json`.
    pub history_path: Option<PathBuf>,

    /// Weight of the raw ETA when it drops below the running countdown.
    /// Default: 0.3
    pub eta_smoothing: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_path: None,
            eta_smoothing: DEFAULT_ETA_SMOOTHING,
        }
    }
}

/// Which phases this invocation may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasesConfig {
    pub setup: bool,
    pub run: bool,
    pub extract: bool,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            setup: true,
            run: true,
            extract: true,
        }
    }
}

impl PhasesConfig {
    pub fn is_enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::Setup => self.setup,
            Phase::Run => self.run,
            Phase::Extract => self.extract,
        }
    }

    pub fn enabled(&self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|phase| self.is_enabled(*phase))
            .collect()
    }

    pub fn set(&mut self, phase: Phase, enabled: bool) {
        match phase {
            Phase::Setup => self.setup = enabled,
            Phase::Run => self.run = enabled,
            Phase::Extract => self.extract = enabled,
        }
    }
}

/// Results location and the slice of the sweep owned by this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub results_root: PathBuf,
    pub shard_index: usize,
    pub shard_count: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("results"),
            shard_index: 0,
            shard_count: 1,
        }
    }
}

/// External commands standing in for scene construction and extraction
/// when the pipeline runs from the command line.
///
/// Each entry is a program followed by its arguments. `{unit_dir}`,
/// `{project}`, `{snapshot}`, `{entity}`, `{frequency_mhz}`, `{scenario}`,
/// `{position}` and `{orientation}` are substituted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub setup: Vec<String>,
    pub extract: Vec<String>,
}

/// Full configuration of one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub execution: ExecutionConfig,
    pub watchdog: WatchdogConfig,
    pub checkpoint: CheckpointConfig,
    pub progress: ProgressConfig,
    pub phases: PhasesConfig,
    pub sweep: SweepConfig,
    pub hooks: HooksConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path` (when given) layered under environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let config: PipelineConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without consulting the environment.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: PipelineConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.sweep.shard_count == 0 || self.sweep.shard_index >= self.sweep.shard_count {
            return Err(ConfigError::InvalidShard {
                index: self.sweep.shard_index,
                count: self.sweep.shard_count,
            });
        }
        if self.execution.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "execution.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.execution.max_attempts == Some(0) {
            return Err(ConfigError::invalid(
                "execution.max_attempts",
                "must be at least 1 when set",
            ));
        }
        let smoothing = self.progress.eta_smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(ConfigError::invalid(
                "progress.eta_smoothing",
                format!("must be in (0, 1], got {}", smoothing),
            ));
        }
        if self.execution.strategy == StrategyKind::Direct
            && self.execution.solver_binary.as_os_str().is_empty()
        {
            return Err(ConfigError::invalid(
                "execution.solver_binary",
                "required by the direct strategy",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.execution.max_attempts {
            Some(max) => RetryPolicy::capped(max),
            None => RetryPolicy::unbounded(),
        }
    }

    pub fn to_engine_settings(&self) -> EngineSettings {
        let execution = &self.execution;
        EngineSettings::new()
            .with_poll_interval(Duration::from_millis(execution.poll_interval_ms))
            .with_terminate_timeout(Duration::from_millis(execution.terminate_timeout_ms))
            .with_drain_timeout(Duration::from_millis(execution.drain_timeout_ms))
            .with_retry_delay(Duration::from_millis(execution.retry_delay_ms))
            .with_settle_time(Duration::from_millis(execution.settle_time_ms))
            .with_result_name(execution.result_name.clone())
            .with_log_milestones(execution.log_milestones)
            .with_retry_policy(self.retry_policy())
            .with_watchdog(self.watchdog)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution.remote_poll_interval_ms)
    }

    pub fn history_path(&self) -> PathBuf {
        self.progress
            .history_path
            .clone()
            .unwrap_or_else(|| self.sweep.results_root.join("sweep_history.json"))
    }

    /// Sets the results root.
    pub fn with_results_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sweep.results_root = root.into();
        self
    }

    /// Sets the shard this instance owns.
    pub fn with_shard(mut self, index: usize, count: usize) -> Self {
        self.sweep.shard_index = index;
        self.sweep.shard_count = count;
        self
    }

    pub fn with_phases(mut self, phases: PhasesConfig) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.execution.max_attempts = max_attempts;
        self
    }
}
