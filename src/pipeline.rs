//! Per-work-unit orchestration: checkpoint decision, phase execution,
//! checkpoint write and progress accounting.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::checkpoint::{ArtifactState, CheckpointError, CheckpointStore, PhaseValidity};
use crate::collaborators::{
    CollaboratorError, ConfigProvider, ProjectDocument, ResultsExtractor, SceneBuilder,
};
use crate::config::{ConfigResult, PhasesConfig, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::execution::{
    CancellationToken, ExecutionEngine, ExecutionError, ExecutionOutcome, ExecutionRequest,
    ExecutionStrategy, KeepAwake, KeepAwakeHandler, ProcessRegistry,
};
use crate::progress::{HistoricalEstimates, Phase, ProgressEstimator};
use crate::telemetry::{Severity, TelemetrySink};
use crate::work_unit::{SweepPlan, WorkUnit};

/// The work units of `study` owned by this instance's shard.
pub fn plan_sweep(study: &Value, config: &PipelineConfig) -> ConfigResult<SweepPlan> {
    SweepPlan::enumerate(study, &config.checkpoint.snapshot)?
        .shard(config.sweep.shard_index, config.sweep.shard_count)
}

/// Phases to execute and phases skipped as already valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhasePlan {
    pub execute: Vec<Phase>,
    pub skip: Vec<Phase>,
}

/// Decide which phases run for one unit.
///
/// An enabled phase runs when its checkpoint is invalid or when an upstream
/// phase runs. Every upstream phase of a running phase must either run too or
/// stay valid; otherwise the missing upstream phase is returned.
pub fn plan_phases(validity: &PhaseValidity, phases: &PhasesConfig) -> Result<PhasePlan, (Phase, Phase)> {
    let mut plan = PhasePlan::default();
    let mut available = Vec::new();
    let mut upstream_rerun = false;

    for phase in Phase::ALL {
        let valid = validity.is_valid(phase) && !upstream_rerun;
        if !phases.is_enabled(phase) {
            if valid {
                available.push(phase);
            }
            continue;
        }
        if valid {
            plan.skip.push(phase);
            available.push(phase);
            continue;
        }
        if let Some(missing) = phase.upstream().iter().find(|up| !available.contains(up)) {
            return Err((phase, *missing));
        }
        plan.execute.push(phase);
        available.push(phase);
        upstream_rerun = true;
    }
    Ok(plan)
}

/// Result of one successfully processed work unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub executed: Vec<Phase>,
    pub skipped: Vec<Phase>,
    /// Solver attempts; zero when the run phase was skipped.
    pub attempts: u32,
    /// Remote job left running when the run phase was only submitted.
    pub submitted_job: Option<String>,
    pub duration: Duration,
}

/// Terminal outcome of one work unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Completed(UnitReport),
    Failed { unit: WorkUnit, error: PipelineError },
}

impl UnitOutcome {
    pub fn unit(&self) -> &WorkUnit {
        match self {
            UnitOutcome::Completed(report) => &report.unit,
            UnitOutcome::Failed { unit, .. } => unit,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, UnitOutcome::Completed(_))
    }
}

/// What happened to every unit of a sweep.
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub total: usize,
    pub outcomes: Vec<UnitOutcome>,
    /// The sweep stopped early on cancellation.
    pub cancelled: bool,
    pub duration: Duration,
}

impl SweepSummary {
    pub fn completed(&self) -> impl Iterator<Item = &UnitReport> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Completed(report) => Some(report),
            UnitOutcome::Failed { .. } => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&WorkUnit, &PipelineError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Failed { unit, error } => Some((unit, error)),
            UnitOutcome::Completed(_) => None,
        })
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    /// Units never reached because the sweep was cancelled.
    pub fn not_started(&self) -> usize {
        self.total.saturating_sub(self.outcomes.len())
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed_count() == 0 && self.not_started() == 0
    }
}

/// External collaborators bound to one pipeline.
pub struct Collaborators {
    pub strategy: ExecutionStrategy,
    pub scene: Box<dyn SceneBuilder>,
    pub extractor: Box<dyn ResultsExtractor>,
    pub document: Box<dyn ProjectDocument>,
    /// Host keep-awake effect. `None` disables it.
    pub keep_awake: Option<Box<dyn KeepAwake>>,
}

enum PhaseOutcome {
    Done { attempts: u32 },
    Submitted { job_id: String, attempts: u32 },
}

/// Drives work units through setup, run and extract.
pub struct Pipeline {
    config: PipelineConfig,
    store: CheckpointStore,
    engine: ExecutionEngine,
    strategy: ExecutionStrategy,
    scene: Box<dyn SceneBuilder>,
    extractor: Box<dyn ResultsExtractor>,
    document: Box<dyn ProjectDocument>,
    telemetry: Arc<dyn TelemetrySink>,
    estimator: ProgressEstimator,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        study: Arc<dyn ConfigProvider>,
        collaborators: Collaborators,
        telemetry: Arc<dyn TelemetrySink>,
        cancel: CancellationToken,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let store = CheckpointStore::new(
            config.sweep.results_root.clone(),
            study,
            config.checkpoint.artifacts.clone(),
            config.checkpoint.snapshot.clone(),
        )?;

        let keep_awake = match collaborators.keep_awake {
            Some(effect) if config.execution.keep_awake => KeepAwakeHandler::new(effect),
            _ => KeepAwakeHandler::disabled(),
        };
        let engine = ExecutionEngine::new(
            config.to_engine_settings(),
            cancel.clone(),
            Arc::clone(&telemetry),
        )
        .with_keep_awake(keep_awake);

        let history = HistoricalEstimates::load_or_default(&config.history_path());
        let estimator = ProgressEstimator::new(history, &config.phases.enabled())
            .with_smoothing(config.progress.eta_smoothing);

        Ok(Self {
            config,
            store,
            engine,
            strategy: collaborators.strategy,
            scene: collaborators.scene,
            extractor: collaborators.extractor,
            document: collaborators.document,
            telemetry,
            estimator,
            cancel,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Live solver processes. Clone it to install a forced-exit hook.
    pub fn registry(&self) -> &ProcessRegistry {
        self.engine.registry()
    }

    pub fn estimator(&self) -> &ProgressEstimator {
        &self.estimator
    }

    /// Process `units` in order.
    ///
    /// Unit-level failures are recorded and the sweep advances. Cancellation
    /// stops the sweep with `cancelled` set. Historical estimates are saved in
    /// every case.
    pub fn run(&mut self, units: &[WorkUnit]) -> PipelineResult<SweepSummary> {
        let started = Instant::now();
        let total = units.len();
        let mut summary = SweepSummary {
            total,
            ..SweepSummary::default()
        };
        info!(total, strategy = %self.strategy.kind(), "starting sweep");
        self.telemetry.log(
            Severity::Progress,
            &format!("Starting sweep of {} work unit{}", total, plural(total)),
        );

        let mut fatal = None;
        for (index, unit) in units.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match self.run_unit(unit, index, total) {
                Ok(report) => summary.outcomes.push(UnitOutcome::Completed(report)),
                Err(err) if err.is_cancellation() => {
                    summary.cancelled = true;
                    break;
                }
                Err(err) if err.is_fatal_for_unit() => {
                    warn!(unit = %unit, error = %err, "work unit failed");
                    self.telemetry
                        .log(Severity::Fatal, &format!("{} failed: {}", unit, err));
                    summary.outcomes.push(UnitOutcome::Failed {
                        unit: unit.clone(),
                        error: err,
                    });
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }

        if summary.cancelled {
            info!(completed = summary.outcomes.len(), total, "sweep cancelled");
            self.telemetry.log(Severity::Warning, "Sweep cancelled");
        }
        self.save_history();

        if let Some(err) = fatal {
            return Err(err);
        }
        summary.duration = started.elapsed();
        self.telemetry.log(
            Severity::Success,
            &format!(
                "Sweep finished: {} completed, {} failed, {} not started",
                summary.completed().count(),
                summary.failed_count(),
                summary.not_started()
            ),
        );
        Ok(summary)
    }

    fn run_unit(&mut self, unit: &WorkUnit, index: usize, total: usize) -> PipelineResult<UnitReport> {
        let started = Instant::now();
        self.estimator.begin_unit();

        if let Err(CheckpointError::CorruptProject { path, reason }) = self.store.check_primary(unit) {
            warn!(unit = %unit, path = %path.display(), %reason, "discarding corrupt project");
            self.telemetry.log(
                Severity::Warning,
                &format!("Corrupt project for {} ({}), rebuilding", unit, reason),
            );
            self.store.discard(unit)?;
        }

        let validity = self.store.verify(unit);
        let plan = plan_phases(&validity, &self.config.phases).map_err(|(phase, missing)| {
            PipelineError::MissingPrerequisite {
                unit: unit.to_string(),
                phase,
                missing,
            }
        })?;
        debug!(unit = %unit, execute = ?plan.execute, skip = ?plan.skip, "phase plan");

        for phase in &plan.skip {
            self.estimator.complete_phase(*phase);
        }
        if plan.execute.is_empty() {
            self.telemetry.log(
                Severity::Progress,
                &format!("{}: all phases valid, skipping", unit),
            );
        }

        let mut report = UnitReport {
            unit: unit.clone(),
            executed: Vec::new(),
            skipped: plan.skip.clone(),
            attempts: 0,
            submitted_job: None,
            duration: Duration::ZERO,
        };

        for phase in plan.execute.iter().copied() {
            if self.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled.into());
            }
            let subtask = phase.subtask();
            let target = self.target_step(index, total, phase);
            self.telemetry.progress(phase, 0, 100);
            self.telemetry.start_animation(
                Duration::from_secs_f64(self.estimator.subtask_estimate(subtask)),
                target,
            );
            self.estimator.start_subtask(subtask);

            let result = self.run_phase(phase, unit);
            self.telemetry.stop_animation();

            match result {
                Ok(PhaseOutcome::Done { attempts }) => {
                    self.estimator.end_subtask(subtask);
                    self.store.write(unit, phase)?;
                    self.estimator.complete_phase(phase);
                    report.executed.push(phase);
                    report.attempts += attempts;
                    self.telemetry.progress(phase, 100, 100);
                    self.report_progress(index, total, phase, unit);
                }
                Ok(PhaseOutcome::Submitted { job_id, attempts }) => {
                    // Results arrive later; nothing downstream can run yet.
                    self.estimator.abandon_subtask(subtask);
                    report.attempts += attempts;
                    report.submitted_job = Some(job_id);
                    break;
                }
                Err(err) => {
                    self.estimator.abandon_subtask(subtask);
                    return Err(err);
                }
            }
        }

        self.estimator.overall_progress(index + 1, total, None);
        report.duration = started.elapsed();
        info!(
            unit = %unit,
            executed = ?report.executed,
            skipped = ?report.skipped,
            attempts = report.attempts,
            "work unit done"
        );
        Ok(report)
    }

    fn run_phase(&mut self, phase: Phase, unit: &WorkUnit) -> PipelineResult<PhaseOutcome> {
        let unit_dir = self.store.unit_dir(unit);
        let project_path = self.store.project_path(unit);
        match phase {
            Phase::Setup => {
                fs::create_dir_all(&unit_dir)?;
                self.store.clear_run_outputs(unit)?;
                let snapshot = self.store.build_surgical_snapshot(unit);
                self.telemetry
                    .log(Severity::Progress, &format!("{}: building scene", unit));
                self.scene.build(unit, &snapshot, &project_path)?;
                match self.store.check_primary(unit)? {
                    ArtifactState::Valid => Ok(PhaseOutcome::Done { attempts: 0 }),
                    state => Err(CollaboratorError::new(
                        "scene",
                        format!("project artifact {} after setup", state),
                    )
                    .into()),
                }
            }
            Phase::Run => {
                let request = ExecutionRequest {
                    unit: unit.clone(),
                    input_path: self.store.input_path(unit),
                    project_path,
                    log_dir: unit_dir,
                };
                let report =
                    self.engine
                        .execute(&mut self.strategy, &request, self.document.as_mut())?;
                Ok(match report.outcome {
                    ExecutionOutcome::Completed => PhaseOutcome::Done {
                        attempts: report.attempts,
                    },
                    ExecutionOutcome::Submitted { job_id } => PhaseOutcome::Submitted {
                        job_id,
                        attempts: report.attempts,
                    },
                })
            }
            Phase::Extract => {
                self.telemetry
                    .log(Severity::Progress, &format!("{}: extracting results", unit));
                self.extractor.extract(unit, &project_path, &unit_dir)?;
                Ok(PhaseOutcome::Done { attempts: 0 })
            }
        }
    }

    /// Overall percent reached once `phase` of unit `index` finishes.
    fn target_step(&self, index: usize, total: usize, phase: Phase) -> u64 {
        if total == 0 {
            return 100;
        }
        let unit_fraction = self.estimator.get_weighted_progress(phase, 1.0);
        ((index as f64 + unit_fraction) / total as f64 * 100.0).round() as u64
    }

    fn report_progress(&mut self, index: usize, total: usize, phase: Phase, unit: &WorkUnit) {
        let percent = self.estimator.overall_progress(index, total, Some((phase, 1.0)));
        let remaining_units = total.saturating_sub(index + 1) as u64;
        let active: Vec<Phase> = self.estimator.active_phases().to_vec();
        let pending: Vec<(&str, u64)> = active
            .iter()
            .map(|p| {
                let current = u64::from(*p > phase);
                (p.subtask(), remaining_units + current)
            })
            .collect();
        let eta = self.estimator.eta(&pending);
        self.telemetry.log(
            Severity::Progress,
            &format!(
                "{}: {} done, overall {:.1}% (ETA {})",
                unit,
                phase,
                percent,
                format_duration(eta)
            ),
        );
    }

    fn save_history(&self) {
        let path = self.config.history_path();
        match self.estimator.save_history(&path) {
            Ok(()) => debug!(path = %path.display(), "historical estimates saved"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to save estimates"),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// `HH:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
