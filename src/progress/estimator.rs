use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use super::history::HistoricalEstimates;
use super::phase::Phase;
use super::ProgressResult;

/// Share of the gap closed per ETA update when the raw estimate drops below
/// the previously displayed countdown.
pub const DEFAULT_ETA_SMOOTHING: f64 = 0.3;

/// Seconds assumed for a subtask nobody has ever timed.
const UNKNOWN_SUBTASK_SECS: f64 = 60.0;

/// Weighted multi-phase progress and ETA for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    history: HistoricalEstimates,
    active: Vec<Phase>,
    weights: BTreeMap<Phase, f64>,
    completed: BTreeSet<Phase>,
    running: BTreeMap<String, Instant>,
    measured: BTreeMap<String, Vec<Duration>>,
    best_progress: f64,
    last_eta: Option<(f64, Instant)>,
    smoothing: f64,
}

impl ProgressEstimator {
    /// Create an estimator for a run that executes `active` phases.
    /// Weights are renormalized so the active phases sum to 1.0.
    pub fn new(history: HistoricalEstimates, active: &[Phase]) -> Self {
        let active: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|phase| active.contains(phase))
            .collect();
        let weights = renormalize(&history, &active);
        debug!(?weights, "phase weights renormalized");
        Self {
            history,
            active,
            weights,
            completed: BTreeSet::new(),
            running: BTreeMap::new(),
            measured: BTreeMap::new(),
            best_progress: 0.0,
            last_eta: None,
            smoothing: DEFAULT_ETA_SMOOTHING,
        }
    }

    /// Sets the ETA smoothing factor. `1.0` disables smoothing.
    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = if smoothing.is_finite() {
            smoothing.clamp(0.0, 1.0)
        } else {
            DEFAULT_ETA_SMOOTHING
        };
        self
    }

    pub fn active_phases(&self) -> &[Phase] {
        &self.active
    }

    /// Weight of `phase`; zero for inactive phases.
    pub fn weight(&self, phase: Phase) -> f64 {
        self.weights.get(&phase).copied().unwrap_or(0.0)
    }

    /// Start accounting for a new work unit.
    pub fn begin_unit(&mut self) {
        self.completed.clear();
    }

    /// Mark `phase` as finished (or skipped as valid) for the current unit.
    pub fn complete_phase(&mut self, phase: Phase) {
        self.completed.insert(phase);
    }

    /// Fraction in `[0, 1]` of the current unit that is done:
    /// completed weights plus `weight(current) * ratio`.
    pub fn get_weighted_progress(&self, current: Phase, ratio: f64) -> f64 {
        let done: f64 = self
            .completed
            .iter()
            .filter(|phase| **phase != current)
            .map(|phase| self.weight(*phase))
            .sum();
        let ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (done + self.weight(current) * ratio).clamp(0.0, 1.0)
    }

    /// Sweep-level progress in percent. Never decreases within a session.
    pub fn overall_progress(
        &mut self,
        done_units: usize,
        total_units: usize,
        current: Option<(Phase, f64)>,
    ) -> f64 {
        let raw = if total_units == 0 {
            100.0
        } else {
            let unit_fraction = current
                .map(|(phase, ratio)| self.get_weighted_progress(phase, ratio))
                .unwrap_or(0.0);
            (done_units as f64 + unit_fraction) / total_units as f64 * 100.0
        };
        self.best_progress = self.best_progress.max(raw.clamp(0.0, 100.0));
        self.best_progress
    }

    /// Latest progress snapshot in percent.
    pub fn progress_snapshot(&self) -> f64 {
        self.best_progress
    }

    pub fn start_subtask(&mut self, subtask: &str) {
        self.start_subtask_at(subtask, Instant::now());
    }

    fn start_subtask_at(&mut self, subtask: &str, now: Instant) {
        self.running.insert(subtask.to_string(), now);
    }

    /// Stop timing `subtask` and record the measured duration.
    pub fn end_subtask(&mut self, subtask: &str) -> Option<Duration> {
        self.end_subtask_at(subtask, Instant::now())
    }

    fn end_subtask_at(&mut self, subtask: &str, now: Instant) -> Option<Duration> {
        let started = self.running.remove(subtask)?;
        let elapsed = now.saturating_duration_since(started);
        self.record_duration(subtask, elapsed);
        Some(elapsed)
    }

    /// Forget a started subtask without recording it (failed or cancelled).
    pub fn abandon_subtask(&mut self, subtask: &str) {
        self.running.remove(subtask);
    }

    pub fn record_duration(&mut self, subtask: &str, elapsed: Duration) {
        self.measured
            .entry(subtask.to_string())
            .or_default()
            .push(elapsed);
    }

    /// Instances of `subtask` completed in this session.
    pub fn completed_instances(&self, subtask: &str) -> usize {
        self.measured.get(subtask).map_or(0, Vec::len)
    }

    /// Expected seconds for one instance of `subtask`.
    ///
    /// Historical until at least one instance completed in this session, the
    /// session's own average afterwards.
    pub fn subtask_estimate(&self, subtask: &str) -> f64 {
        if let Some(average) = self.measured_average(subtask) {
            return average;
        }
        self.history
            .subtask_estimate(subtask)
            .unwrap_or(UNKNOWN_SUBTASK_SECS)
    }

    /// Remaining time for `pending` subtask instances plus whatever is
    /// left of the subtasks currently running.
    pub fn eta(&mut self, pending: &[(&str, u64)]) -> Duration {
        self.eta_at(Instant::now(), pending)
    }

    fn eta_at(&mut self, now: Instant, pending: &[(&str, u64)]) -> Duration {
        let queued: f64 = pending
            .iter()
            .map(|(subtask, count)| self.subtask_estimate(subtask) * *count as f64)
            .sum();
        let in_flight: f64 = self
            .running
            .iter()
            .map(|(subtask, started)| {
                let elapsed = now.saturating_duration_since(*started).as_secs_f64();
                (self.subtask_estimate(subtask) - elapsed).max(0.0)
            })
            .sum();
        let raw = queued + in_flight;

        let displayed = match self.last_eta {
            _ if raw <= 0.0 => 0.0,
            Some((previous, at)) => {
                let expected =
                    (previous - now.saturating_duration_since(at).as_secs_f64()).max(0.0);
                if raw < expected {
                    expected + self.smoothing * (raw - expected)
                } else {
                    raw
                }
            }
            None => raw,
        };
        self.last_eta = Some((displayed, now));
        Duration::from_secs_f64(displayed.max(0.0))
    }

    /// Historical estimates improved by this session's measurements.
    ///
    /// Every measured subtask gets its session average. Phase weights are
    /// replaced by measured proportions only when all phases were measured.
    pub fn to_history(&self) -> HistoricalEstimates {
        let mut history = self.history.clone();
        for subtask in self.measured.keys() {
            if let Some(average) = self.measured_average(subtask) {
                history.subtask_estimates.insert(subtask.clone(), average);
            }
        }

        let phase_averages: Vec<(Phase, f64)> = Phase::ALL
            .into_iter()
            .filter_map(|phase| self.measured_average(phase.subtask()).map(|avg| (phase, avg)))
            .collect();
        let total: f64 = phase_averages.iter().map(|(_, avg)| avg).sum();
        if phase_averages.len() == Phase::ALL.len() && total > 0.0 {
            for (phase, average) in phase_averages {
                history
                    .phase_weights
                    .insert(phase.as_str().to_string(), average / total);
            }
        }

        history.updated_at = Some(Utc::now());
        history
    }

    /// Persist [`to_history`](Self::to_history) to `path`.
    pub fn save_history(&self, path: &Path) -> ProgressResult<()> {
        self.to_history().save(path)
    }

    fn measured_average(&self, subtask: &str) -> Option<f64> {
        let samples = self.measured.get(subtask)?;
        if samples.is_empty() {
            return None;
        }
        let total: f64 = samples.iter().map(Duration::as_secs_f64).sum();
        Some(total / samples.len() as f64)
    }
}

fn renormalize(history: &HistoricalEstimates, active: &[Phase]) -> BTreeMap<Phase, f64> {
    let defaults = HistoricalEstimates::default();
    let raw: Vec<(Phase, f64)> = active
        .iter()
        .map(|phase| {
            let weight = history
                .phase_weight(*phase)
                .or_else(|| defaults.phase_weight(*phase))
                .unwrap_or(0.0);
            (*phase, weight)
        })
        .collect();
    let total: f64 = raw.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        let equal = 1.0 / active.len().max(1) as f64;
        return active.iter().map(|phase| (*phase, equal)).collect();
    }
    raw.into_iter().map(|(phase, w)| (phase, w / total)).collect()
}
