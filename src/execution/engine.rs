//! The per-work-unit retry loop.
//!
//! For the direct strategy one attempt walks
//! `Idle -> Starting -> Monitoring -> (Succeeded | Failed)`; a failure goes
//! back to `Starting` when the retry handler allows it, and the path to `Done`
//! always passes through post-run verification.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::error::{ExecutionError, ExecutionResult};
use super::keep_awake::KeepAwakeHandler;
use super::parser::{OutputParser, ProgressInfo};
use super::post_sim::PostSimulationHandler;
use super::process::{ProcessManager, SolverCommand, DEFAULT_DRAIN_TIMEOUT};
use super::registry::{ProcessRegistry, RegistrationId};
use super::retry::{RetryDecision, RetryHandler, RetryPolicy};
use super::strategy::ExecutionStrategy;
use super::watchdog::{AttemptWatchdog, WatchdogConfig};
use crate::collaborators::{HostApi, ProjectDocument, RemoteJobStatus, RemoteSubmitter};
use crate::progress::Phase;
use crate::telemetry::{Severity, TelemetrySink};
use crate::work_unit::WorkUnit;

/// Name of the result object the solver writes on success.
pub const DEFAULT_RESULT_NAME: &str = "Overall Field";

/// Tunables for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Sleep between monitoring iterations.
    /// Default: 200 ms
    pub poll_interval: Duration,

    /// Grace period between SIGTERM and a forced kill.
    /// Default: 10 seconds
    pub terminate_timeout: Duration,

    /// Bounded wait for the stdout reader after the process exited.
    /// Default: 10 seconds
    pub drain_timeout: Duration,

    /// Pause before starting a retry.
    /// Default: 2 seconds
    pub retry_delay: Duration,

    /// Wait before reloading the project document after a run.
    /// Default: 5 seconds
    pub settle_time: Duration,

    /// Result object that must exist after a successful run.
    pub result_name: String,

    /// Whether 0/33/66% milestones are logged at progress level.
    pub log_milestones: bool,

    pub retry: RetryPolicy,

    pub watchdog: WatchdogConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            terminate_timeout: Duration::from_secs(10),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            retry_delay: Duration::from_secs(2),
            settle_time: Duration::from_secs(5),
            result_name: DEFAULT_RESULT_NAME.to_string(),
            log_milestones: true,
            retry: RetryPolicy::unbounded(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle_time = settle;
        self
    }

    pub fn with_result_name(mut self, name: impl Into<String>) -> Self {
        self.result_name = name.into();
        self
    }

    pub fn with_log_milestones(mut self, enabled: bool) -> Self {
        self.log_milestones = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }
}

/// Everything the engine needs to know about the unit being run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub unit: WorkUnit,
    /// Input artifact handed to the solver with `-i`.
    pub input_path: PathBuf,
    /// Project document reloaded after the run.
    pub project_path: PathBuf,
    /// Directory for per-attempt stderr logs.
    pub log_dir: PathBuf,
}

/// Terminal outcome of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The solver finished and its results were verified.
    Completed,
    /// The unit was handed to a remote service that is not being waited on.
    Submitted { job_id: String },
}

/// Summary of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub attempts: u32,
    pub outcome: ExecutionOutcome,
    /// Every solver error seen across all attempts, in order.
    pub detected_errors: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct AttemptOutcome {
    exit_code: Option<i32>,
    detected_errors: Vec<String>,
}

/// Registers a process for the duration of one attempt. Dropping the guard
/// cleans the process up and removes it from the registry on every exit path.
struct AttemptGuard {
    registry: ProcessRegistry,
    id: RegistrationId,
    process: Arc<ProcessManager>,
}

impl AttemptGuard {
    fn register(registry: &ProcessRegistry, process: Arc<ProcessManager>) -> Self {
        let id = registry.register(Arc::clone(&process));
        Self {
            registry: registry.clone(),
            id,
            process,
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.process.cleanup();
        self.registry.deregister(self.id);
    }
}

/// Drives the solver for one work unit at a time.
pub struct ExecutionEngine {
    settings: EngineSettings,
    registry: ProcessRegistry,
    cancel: CancellationToken,
    telemetry: Arc<dyn TelemetrySink>,
    keep_awake: KeepAwakeHandler,
    parser: OutputParser,
}

impl ExecutionEngine {
    pub fn new(
        settings: EngineSettings,
        cancel: CancellationToken,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            settings,
            registry: ProcessRegistry::new(),
            cancel,
            telemetry,
            keep_awake: KeepAwakeHandler::disabled(),
            parser: OutputParser::new(),
        }
    }

    pub fn with_keep_awake(mut self, keep_awake: KeepAwakeHandler) -> Self {
        self.keep_awake = keep_awake;
        self
    }

    pub fn with_registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Live processes of this engine. Clone it to install a forced-exit hook.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `request` through `strategy` until it succeeds or fails terminally.
    pub fn execute(
        &mut self,
        strategy: &mut ExecutionStrategy,
        request: &ExecutionRequest,
        document: &mut dyn ProjectDocument,
    ) -> ExecutionResult<ExecutionReport> {
        let started = Instant::now();
        let mut retry = RetryHandler::new(self.settings.retry);
        self.keep_awake.reset();
        info!(unit = %request.unit, strategy = %strategy.kind(), "executing work unit");

        let detected_errors = match strategy {
            ExecutionStrategy::Direct {
                solver_binary,
                flags,
            } => {
                let mut command =
                    SolverCommand::solver(solver_binary.clone(), &request.input_path, flags);
                if let Some(dir) = request.project_path.parent() {
                    command = command.current_dir(dir);
                }
                self.retry_loop(&mut retry, request, |engine, attempt| {
                    engine.run_direct_attempt(&command, request, attempt)
                })?
            }
            ExecutionStrategy::LocalApi(host) => self.retry_loop(&mut retry, request, |engine, _| {
                engine.run_host_attempt(host.as_mut(), request)
            })?,
            ExecutionStrategy::RemoteSubmit {
                submitter,
                wait,
                poll_interval,
            } => {
                if !*wait {
                    self.ensure_not_cancelled()?;
                    let attempts = retry.record_attempt();
                    let job_id = submitter
                        .submit(&request.unit, &request.input_path)
                        .map_err(|e| ExecutionError::Strategy(e.to_string()))?;
                    info!(unit = %request.unit, job_id = %job_id, "submitted to remote service");
                    self.telemetry.log(
                        Severity::Success,
                        &format!("Submitted {} as remote job {}", request.unit, job_id),
                    );
                    return Ok(ExecutionReport {
                        attempts,
                        outcome: ExecutionOutcome::Submitted { job_id },
                        detected_errors: Vec::new(),
                        duration: started.elapsed(),
                    });
                }
                let poll = *poll_interval;
                self.retry_loop(&mut retry, request, |engine, _| {
                    engine.run_remote_attempt(submitter.as_mut(), request, poll)
                })?
            }
        };

        PostSimulationHandler::new(self.settings.settle_time, self.settings.result_name.clone())
            .verify(document, &request.project_path)?;

        let attempts = retry.attempt_number();
        self.telemetry.log(
            Severity::Success,
            &format!(
                "Solver finished for {} after {} attempt{}",
                request.unit,
                attempts,
                if attempts == 1 { "" } else { "s" }
            ),
        );
        Ok(ExecutionReport {
            attempts,
            outcome: ExecutionOutcome::Completed,
            detected_errors,
            duration: started.elapsed(),
        })
    }

    fn retry_loop<F>(
        &mut self,
        retry: &mut RetryHandler,
        request: &ExecutionRequest,
        mut run_attempt: F,
    ) -> ExecutionResult<Vec<String>>
    where
        F: FnMut(&mut Self, u32) -> ExecutionResult<AttemptOutcome>,
    {
        let mut detected = Vec::new();
        loop {
            // Idle -> Starting
            self.ensure_not_cancelled()?;
            let attempt = retry.record_attempt();
            self.keep_awake.before_attempt(attempt);
            self.parser.reset_milestones();
            if attempt > 1 {
                self.telemetry.log(
                    Severity::Progress,
                    &format!("Retrying solver for {} (attempt {})", request.unit, attempt),
                );
            }

            let outcome = match run_attempt(self, attempt) {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancellation() => {
                    info!(unit = %request.unit, attempt, "solver attempt cancelled");
                    return Err(err);
                }
                Err(err @ ExecutionError::StartFailed { .. }) => return Err(err),
                Err(err) => {
                    error!(
                        unit = %request.unit,
                        attempt,
                        error = %error_chain(&err),
                        "unexpected error during solver attempt"
                    );
                    AttemptOutcome::default()
                }
            };

            let AttemptOutcome {
                exit_code,
                detected_errors,
            } = outcome;
            let decision = retry.decide(exit_code, &detected_errors);
            detected.extend(detected_errors);

            match decision {
                RetryDecision::Succeeded => {
                    info!(unit = %request.unit, attempt, "solver attempt succeeded");
                    return Ok(detected);
                }
                RetryDecision::Retry => {
                    warn!(unit = %request.unit, attempt, ?exit_code, "solver attempt failed, retrying");
                    self.telemetry.log(
                        Severity::Warning,
                        &format!(
                            "Solver attempt {} for {} failed (exit code {}), retrying",
                            attempt,
                            request.unit,
                            exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
                        ),
                    );
                    self.pause_before_retry()?;
                }
                RetryDecision::FatalOutOfMemory { message } => {
                    self.telemetry.log(
                        Severity::Fatal,
                        &format!("Solver ran out of memory for {}: {}", request.unit, message),
                    );
                    return Err(ExecutionError::OutOfMemory { message });
                }
                RetryDecision::Exhausted { attempts } => {
                    return Err(ExecutionError::RetriesExhausted {
                        attempts,
                        last_exit_code: exit_code,
                    });
                }
            }
        }
    }

    fn run_direct_attempt(
        &mut self,
        command: &SolverCommand,
        request: &ExecutionRequest,
        attempt: u32,
    ) -> ExecutionResult<AttemptOutcome> {
        let stderr_path = request
            .log_dir
            .join(format!("solver_attempt_{}.stderr.log", attempt));
        let process = Arc::new(ProcessManager::new(Some(stderr_path)));
        let _guard = AttemptGuard::register(&self.registry, Arc::clone(&process));

        process.start(command)?;
        info!(unit = %request.unit, attempt, pid = ?process.pid(), "solver started");

        // Monitoring
        let mut watchdog = AttemptWatchdog::start(self.settings.watchdog);
        let mut errors = Vec::new();
        while process.is_running() {
            if self.cancel.is_cancelled() {
                process.terminate(self.settings.terminate_timeout);
                return Err(ExecutionError::Cancelled);
            }

            let lines = process.read_available_lines();
            if !lines.is_empty() {
                watchdog.pulse();
            }
            for line in &lines {
                self.handle_line(line, &mut errors);
            }

            if let Some(trip) = watchdog.check() {
                warn!(unit = %request.unit, attempt, %trip, "watchdog ended solver attempt");
                self.telemetry.log(
                    Severity::Warning,
                    &format!("Stopping solver for {}: {}", request.unit, trip),
                );
                process.terminate(self.settings.terminate_timeout);
                for line in process.read_all_remaining_lines(self.settings.drain_timeout) {
                    self.handle_line(&line, &mut errors);
                }
                return Ok(AttemptOutcome {
                    exit_code: None,
                    detected_errors: errors,
                });
            }

            thread::sleep(self.settings.poll_interval);
        }

        for line in process.read_all_remaining_lines(self.settings.drain_timeout) {
            self.handle_line(&line, &mut errors);
        }

        let exit_code = process.exit_code();
        if exit_code != Some(0) && errors.is_empty() {
            let stderr = process.read_stderr();
            for line in stderr.lines() {
                let parsed = self.parser.parse_line(line);
                if let Some(message) = parsed.error_message {
                    self.telemetry
                        .log(Severity::Progress, &format!("Solver error: {}", message));
                    errors.push(message);
                }
            }
            if !stderr.trim().is_empty() {
                debug!(unit = %request.unit, attempt, stderr = %stderr.trim(), "solver stderr");
            }
        }

        Ok(AttemptOutcome {
            exit_code,
            detected_errors: errors,
        })
    }

    fn run_host_attempt(
        &mut self,
        host: &mut dyn HostApi,
        request: &ExecutionRequest,
    ) -> ExecutionResult<AttemptOutcome> {
        match host.run_solver(&request.input_path, &self.cancel) {
            Ok(()) => Ok(AttemptOutcome {
                exit_code: Some(0),
                detected_errors: Vec::new(),
            }),
            Err(_) if self.cancel.is_cancelled() => Err(ExecutionError::Cancelled),
            Err(err) => {
                self.telemetry
                    .log(Severity::Progress, &format!("Solver error: {}", err.message));
                Ok(AttemptOutcome {
                    exit_code: err.exit_code.filter(|code| *code != 0),
                    detected_errors: vec![err.message],
                })
            }
        }
    }

    fn run_remote_attempt(
        &mut self,
        submitter: &mut dyn RemoteSubmitter,
        request: &ExecutionRequest,
        poll_interval: Duration,
    ) -> ExecutionResult<AttemptOutcome> {
        let job_id = submitter
            .submit(&request.unit, &request.input_path)
            .map_err(|e| ExecutionError::Strategy(e.to_string()))?;
        info!(unit = %request.unit, job_id = %job_id, "remote job submitted");

        loop {
            if self.cancel.is_cancelled() {
                if let Err(err) = submitter.cancel(&job_id) {
                    warn!(job_id = %job_id, error = %err, "failed to cancel remote job");
                }
                return Err(ExecutionError::Cancelled);
            }

            let status = submitter
                .status(&job_id)
                .map_err(|e| ExecutionError::Strategy(e.to_string()))?;
            match status {
                RemoteJobStatus::Queued => {}
                RemoteJobStatus::Running { progress_percent } => {
                    if let Some(percentage) = progress_percent {
                        self.observe_progress(percentage, None);
                    }
                }
                RemoteJobStatus::Succeeded => {
                    return Ok(AttemptOutcome {
                        exit_code: Some(0),
                        detected_errors: Vec::new(),
                    });
                }
                RemoteJobStatus::Failed { message } => {
                    self.telemetry.log(
                        Severity::Progress,
                        &format!("Remote job {} failed: {}", job_id, message),
                    );
                    return Ok(AttemptOutcome {
                        exit_code: None,
                        detected_errors: vec![message],
                    });
                }
            }
            thread::sleep(poll_interval);
        }
    }

    fn handle_line(&mut self, line: &str, errors: &mut Vec<String>) {
        let parsed = self.parser.parse_line(line);
        if parsed.is_error {
            let message = parsed
                .error_message
                .unwrap_or_else(|| line.trim().to_string());
            self.telemetry
                .log(Severity::Progress, &format!("Solver error: {}", message));
            errors.push(message);
        } else if let Some(progress) = parsed.progress_info {
            self.observe_progress(progress.percentage, Some(&progress));
        } else {
            self.telemetry.log(Severity::Verbose, line);
        }
    }

    fn observe_progress(&mut self, percentage: f64, detail: Option<&ProgressInfo>) {
        self.keep_awake.on_progress();
        let percent = percentage.clamp(0.0, 100.0).round() as u64;
        self.telemetry.progress(Phase::Run, percent, 100);

        if !self.settings.log_milestones {
            return;
        }
        for milestone in self.parser.crossed_milestones(percentage) {
            let message = match detail {
                Some(info) => match &info.speed {
                    Some(speed) => format!(
                        "Solver progress: {}% (remaining {}, {})",
                        milestone, info.time_remaining, speed
                    ),
                    None => format!(
                        "Solver progress: {}% (remaining {})",
                        milestone, info.time_remaining
                    ),
                },
                None => format!("Solver progress: {}%", milestone),
            };
            self.telemetry.log(Severity::Progress, &message);
        }
    }

    fn ensure_not_cancelled(&self) -> ExecutionResult<()> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn pause_before_retry(&self) -> ExecutionResult<()> {
        let deadline = Instant::now() + self.settings.retry_delay;
        loop {
            self.ensure_not_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let step = self
                .settings
                .poll_interval
                .max(Duration::from_millis(1))
                .min(deadline - now);
            thread::sleep(step);
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("settings", &self.settings)
            .field("live_processes", &self.registry.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Render an error with all of its sources.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, HostApiError};
    use crate::execution::post_sim::tests::FakeDocument;
    use crate::telemetry::RecordingSink;
    use std::collections::VecDeque;
    use std::path::Path;
    use tempfile::TempDir;

    fn unit() -> WorkUnit {
        WorkUnit::new("thelonious", 700, "by_cheek", "center", "vertical")
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_delay(Duration::ZERO)
            .with_settle_time(Duration::ZERO)
            .with_terminate_timeout(Duration::from_secs(2))
    }

    fn request(dir: &Path) -> ExecutionRequest {
        ExecutionRequest {
            unit: unit(),
            input_path: dir.join("project_Input.h5"),
            project_path: dir.join("project.smash"),
            log_dir: dir.join("logs"),
        }
    }

    fn engine(settings: EngineSettings) -> (ExecutionEngine, RecordingSink) {
        let sink = RecordingSink::new();
        let engine = ExecutionEngine::new(settings, CancellationToken::new(), Arc::new(sink.clone()));
        (engine, sink)
    }

    struct FlakyHost {
        failures_left: u32,
        exit_code: Option<i32>,
        message: String,
        calls: u32,
    }

    impl HostApi for FlakyHost {
        fn run_solver(
            &mut self,
            _input: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), HostApiError> {
            self.calls += 1;
            if self.failures_left == 0 {
                return Ok(());
            }
            self.failures_left -= 1;
            Err(HostApiError {
                exit_code: self.exit_code,
                message: self.message.clone(),
            })
        }
    }

    struct ScriptedRemote {
        statuses: VecDeque<RemoteJobStatus>,
        submitted: u32,
        cancelled: Vec<String>,
    }

    impl RemoteSubmitter for ScriptedRemote {
        fn submit(&mut self, _unit: &WorkUnit, _input: &Path) -> Result<String, CollaboratorError> {
            self.submitted += 1;
            Ok(format!("job-{}", self.submitted))
        }

        fn status(&mut self, _job_id: &str) -> Result<RemoteJobStatus, CollaboratorError> {
            Ok(self
                .statuses
                .pop_front()
                .unwrap_or(RemoteJobStatus::Running { progress_percent: None }))
        }

        fn cancel(&mut self, job_id: &str) -> Result<(), CollaboratorError> {
            self.cancelled.push(job_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_local_api_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        let (mut engine, sink) = engine(fast_settings());
        let mut strategy = ExecutionStrategy::LocalApi(Box::new(FlakyHost {
            failures_left: 2,
            exit_code: Some(1),
            message: "ERROR: driver reset".to_string(),
            calls: 0,
        }));
        let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

        let report = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect("completes");

        assert_eq!(report.attempts, 3);
        assert_eq!(report.outcome, ExecutionOutcome::Completed);
        assert_eq!(report.detected_errors.len(), 2);
        assert_eq!(sink.messages(Severity::Warning).len(), 2);
        assert_eq!(sink.messages(Severity::Success).len(), 1);
    }

    #[test]
    fn test_local_api_out_of_memory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _sink) = engine(fast_settings());
        let mut strategy = ExecutionStrategy::LocalApi(Box::new(FlakyHost {
            failures_left: 5,
            exit_code: Some(1),
            message: "cudaErrorMemoryAllocation".to_string(),
            calls: 0,
        }));
        let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

        let err = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect_err("oom");
        assert!(matches!(err, ExecutionError::OutOfMemory { .. }));
    }

    #[test]
    fn test_capped_policy_reports_exhaustion() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _sink) = engine(fast_settings().with_retry_policy(RetryPolicy::capped(2)));
        let mut strategy = ExecutionStrategy::LocalApi(Box::new(FlakyHost {
            failures_left: 10,
            exit_code: Some(4),
            message: "ERROR: license checkout failed".to_string(),
            calls: 0,
        }));
        let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

        let err = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect_err("exhausted");
        assert!(matches!(
            err,
            ExecutionError::RetriesExhausted {
                attempts: 2,
                last_exit_code: Some(4)
            }
        ));
    }

    #[test]
    fn test_cancel_before_start_does_not_attempt() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _sink) = engine(fast_settings());
        engine.cancellation().cancel();
        let mut strategy = ExecutionStrategy::LocalApi(Box::new(FlakyHost {
            failures_left: 0,
            exit_code: None,
            message: String::new(),
            calls: 0,
        }));
        let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

        let err = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect_err("cancelled");
        assert!(err.is_cancellation());
        assert_eq!(document.reopen_count, 0);
    }

    #[test]
    fn test_remote_without_wait_returns_job_id() {
        let dir = TempDir::new().unwrap();
        let (mut engine, _sink) = engine(fast_settings());
        let mut strategy = ExecutionStrategy::RemoteSubmit {
            submitter: Box::new(ScriptedRemote {
                statuses: VecDeque::new(),
                submitted: 0,
                cancelled: Vec::new(),
            }),
            wait: false,
            poll_interval: Duration::from_millis(1),
        };
        let mut document = FakeDocument::default();

        let report = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect("submitted");
        assert_eq!(
            report.outcome,
            ExecutionOutcome::Submitted {
                job_id: "job-1".to_string()
            }
        );
        assert_eq!(document.reopen_count, 0);
    }

    #[test]
    fn test_remote_wait_resubmits_failed_job() {
        let dir = TempDir::new().unwrap();
        let (mut engine, sink) = engine(fast_settings());
        let mut strategy = ExecutionStrategy::RemoteSubmit {
            submitter: Box::new(ScriptedRemote {
                statuses: VecDeque::from(vec![
                    RemoteJobStatus::Queued,
                    RemoteJobStatus::Failed {
                        message: "node lost".to_string(),
                    },
                    RemoteJobStatus::Running {
                        progress_percent: Some(50.0),
                    },
                    RemoteJobStatus::Succeeded,
                ]),
                submitted: 0,
                cancelled: Vec::new(),
            }),
            wait: true,
            poll_interval: Duration::from_millis(1),
        };
        let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

        let report = engine
            .execute(&mut strategy, &request(dir.path()), &mut document)
            .expect("completes");
        assert_eq!(report.attempts, 2);
        assert_eq!(report.detected_errors, vec!["node lost".to_string()]);
        let milestones: Vec<String> = sink
            .messages(Severity::Progress)
            .into_iter()
            .filter(|m| m.starts_with("Solver progress:"))
            .collect();
        assert_eq!(milestones, vec!["Solver progress: 0%", "Solver progress: 33%"]);
        assert_eq!(document.reopen_count, 1);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = ExecutionError::StartFailed {
            command: "solve".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let rendered = error_chain(&err);
        assert!(rendered.ends_with(": no such file"));
    }

    #[cfg(unix)]
    mod direct {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        const PROGRESS_1: &str = "[PROGRESS]: 1% [ 1/22 ] Time Update, estimated remaining time 2 minutes 10 seconds @ 98.2 MCells/s";
        const PROGRESS_50: &str = "[PROGRESS]: 50% [ 11/22 ] Time Update, estimated remaining time 1 minutes 5 seconds @ 101.7 MCells/s";
        const PROGRESS_70: &str = "[PROGRESS]: 70% [ 15/22 ] Time Update, estimated remaining time 39 seconds @ 102.0 MCells/s";

        /// Writes an executable fake solver that fails `failures` times before
        /// succeeding. Attempts are counted in a file next to the script.
        fn fake_solver(dir: &Path, failures: u32, failure_line: &str) -> PathBuf {
            let counter = dir.join("attempts");
            let script = format!(
                "#!/bin/sh\n\
                 n=$(cat '{counter}' 2>/dev/null || echo 0)\n\
                 n=$((n + 1))\n\
                 echo $n > '{counter}'\n\
                 echo 'Loading input'\n\
                 echo '{p1}'\n\
                 if [ $n -le {failures} ]; then\n\
                   echo '{failure_line}'\n\
                   exit 1\n\
                 fi\n\
                 echo '{p50}'\n\
                 echo '{p70}'\n\
                 exit 0\n",
                counter = counter.display(),
                p1 = PROGRESS_1,
                p50 = PROGRESS_50,
                p70 = PROGRESS_70,
                failures = failures,
                failure_line = failure_line,
            );
            let path = dir.join("fake_solver.sh");
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn attempts_recorded(dir: &Path) -> u32 {
            fs::read_to_string(dir.join("attempts"))
                .unwrap()
                .trim()
                .parse()
                .unwrap()
        }

        #[test]
        fn test_direct_retries_until_success() {
            let dir = TempDir::new().unwrap();
            let solver = fake_solver(dir.path(), 2, "ERROR: CUDA driver reset");
            let (mut engine, sink) = engine(fast_settings());
            let mut strategy = ExecutionStrategy::direct(solver, Vec::new());
            let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

            let report = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect("completes");

            assert_eq!(report.attempts, 3);
            assert_eq!(attempts_recorded(dir.path()), 3);
            assert_eq!(
                report.detected_errors,
                vec!["ERROR: CUDA driver reset".to_string(); 2]
            );
            assert!(engine.registry().is_empty());

            let progress = sink.messages(Severity::Progress);
            let zero = progress.iter().filter(|m| m.starts_with("Solver progress: 0%")).count();
            let sixty_six = progress.iter().filter(|m| m.starts_with("Solver progress: 66%")).count();
            assert_eq!(zero, 3, "0% milestone repeats on every attempt");
            assert_eq!(sixty_six, 1);
            assert!(progress.iter().any(|m| m == "Solver error: ERROR: CUDA driver reset"));
            assert!(sink.messages(Severity::Verbose).iter().any(|m| m == "Loading input"));
            assert!(dir.path().join("logs/solver_attempt_3.stderr.log").exists());
        }

        #[test]
        fn test_direct_out_of_memory_stops_after_one_attempt() {
            let dir = TempDir::new().unwrap();
            let solver = fake_solver(dir.path(), 5, "FATAL: out of memory on device 0");
            let (mut engine, sink) = engine(fast_settings());
            let mut strategy = ExecutionStrategy::direct(solver, Vec::new());
            let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

            let err = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect_err("oom");
            assert!(matches!(err, ExecutionError::OutOfMemory { .. }));
            assert_eq!(attempts_recorded(dir.path()), 1);
            assert_eq!(sink.messages(Severity::Fatal).len(), 1);
        }

        #[test]
        fn test_direct_missing_results_is_fatal() {
            let dir = TempDir::new().unwrap();
            let solver = fake_solver(dir.path(), 0, "");
            let (mut engine, _sink) = engine(fast_settings());
            let mut strategy = ExecutionStrategy::direct(solver, Vec::new());
            let mut document = FakeDocument::default();

            let err = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect_err("no results");
            assert!(matches!(err, ExecutionError::ResultsNotFound { .. }));
            assert_eq!(attempts_recorded(dir.path()), 1);
        }

        #[test]
        fn test_missing_binary_is_start_failure() {
            let dir = TempDir::new().unwrap();
            let (mut engine, _sink) = engine(fast_settings());
            let mut strategy = ExecutionStrategy::direct(dir.path().join("missing-solver"), Vec::new());
            let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

            let err = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect_err("start failure");
            assert!(matches!(err, ExecutionError::StartFailed { .. }));
            assert!(engine.registry().is_empty());
        }

        #[test]
        fn test_cancel_mid_monitoring_terminates_process() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("endless_solver.sh");
            let script = format!(
                "#!/bin/sh\nwhile true; do echo '{}'; sleep 0.05; done\n",
                PROGRESS_1
            );
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

            let settings = fast_settings();
            let terminate_timeout = settings.terminate_timeout;
            let (mut engine, sink) = engine(settings);
            let cancel = engine.cancellation().clone();
            let registry = engine.registry().clone();
            let mut strategy = ExecutionStrategy::direct(path, Vec::new());
            let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

            let canceller = thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);
                while registry.is_empty() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                thread::sleep(Duration::from_millis(200));
                let cancelled_at = Instant::now();
                cancel.cancel();
                cancelled_at
            });

            let err = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect_err("cancelled");
            let returned_at = Instant::now();
            let cancelled_at = canceller.join().unwrap();

            assert!(err.is_cancellation());
            assert!(returned_at.duration_since(cancelled_at) < terminate_timeout + Duration::from_secs(1));
            assert!(engine.registry().is_empty());
            assert!(sink.messages(Severity::Error).is_empty());
            assert_eq!(document.reopen_count, 0);
        }

        #[test]
        fn test_watchdog_stall_counts_as_failed_attempt() {
            let dir = TempDir::new().unwrap();
            let counter = dir.path().join("attempts");
            let path = dir.path().join("stalling_solver.sh");
            let script = format!(
                "#!/bin/sh\n\
                 n=$(cat '{counter}' 2>/dev/null || echo 0)\n\
                 n=$((n + 1))\n\
                 echo $n > '{counter}'\n\
                 if [ $n -eq 1 ]; then exec sleep 30; fi\n\
                 exit 0\n",
                counter = counter.display()
            );
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

            let settings = fast_settings()
                .with_watchdog(WatchdogConfig::new().with_stall_timeout(Duration::from_secs(1)));
            let (mut engine, sink) = engine(settings);
            let mut strategy = ExecutionStrategy::direct(path, Vec::new());
            let mut document = FakeDocument::with_result(DEFAULT_RESULT_NAME);

            let report = engine
                .execute(&mut strategy, &request(dir.path()), &mut document)
                .expect("second attempt succeeds");
            assert_eq!(report.attempts, 2);
            assert!(sink
                .messages(Severity::Warning)
                .iter()
                .any(|m| m.contains("no solver output")));
        }
    }
}
