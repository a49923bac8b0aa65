//! Telemetry sink for operator-facing output.
//!
//! The pipeline reports three kinds of signal: severity-tagged log lines,
//! discrete progress updates per phase, and animation hints that let a UI
//! animate a bar towards an expected step over an estimated duration.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::progress::Phase;

/// Severity of a telemetry log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Raw solver chatter and internals.
    Verbose,
    /// Operator-level progress, including live solver diagnostics.
    Progress,
    Success,
    Warning,
    Error,
    /// A work unit was aborted.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Verbose => "verbose",
            Severity::Progress => "progress",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Receiver for pipeline telemetry. Implementations must be cheap; they run on
/// the controlling thread inside the monitoring loop.
pub trait TelemetrySink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    /// Discrete progress: `current` of `total` steps within `phase`.
    fn progress(&self, phase: Phase, current: u64, total: u64);

    /// Start animating towards `target_step` over `estimated`.
    fn start_animation(&self, estimated: Duration, target_step: u64);

    fn stop_animation(&self);
}

/// Forwards telemetry to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Verbose => debug!(target: "solver_sweep::telemetry", "{}", message),
            Severity::Progress | Severity::Success => {
                info!(target: "solver_sweep::telemetry", %severity, "{}", message)
            }
            Severity::Warning => warn!(target: "solver_sweep::telemetry", "{}", message),
            Severity::Error | Severity::Fatal => {
                error!(target: "solver_sweep::telemetry", %severity, "{}", message)
            }
        }
    }

    fn progress(&self, phase: Phase, current: u64, total: u64) {
        debug!(target: "solver_sweep::telemetry", %phase, current, total, "progress");
    }

    fn start_animation(&self, estimated: Duration, target_step: u64) {
        debug!(
            target: "solver_sweep::telemetry",
            estimated_secs = estimated.as_secs_f64(),
            target_step,
            "animation started"
        );
    }

    fn stop_animation(&self) {
        debug!(target: "solver_sweep::telemetry", "animation stopped");
    }
}

/// One recorded telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Log(Severity, String),
    Progress {
        phase: Phase,
        current: u64,
        total: u64,
    },
    AnimationStarted {
        estimated: Duration,
        target_step: u64,
    },
    AnimationStopped,
}

/// Sink that keeps every event in memory. Useful for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Messages logged at exactly `severity`.
    pub fn messages(&self, severity: Severity) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::Log(s, message) if s == severity => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TelemetrySink for RecordingSink {
    fn log(&self, severity: Severity, message: &str) {
        self.push(TelemetryEvent::Log(severity, message.to_string()));
    }

    fn progress(&self, phase: Phase, current: u64, total: u64) {
        self.push(TelemetryEvent::Progress {
            phase,
            current,
            total,
        });
    }

    fn start_animation(&self, estimated: Duration, target_step: u64) {
        self.push(TelemetryEvent::AnimationStarted {
            estimated,
            target_step,
        });
    }

    fn stop_animation(&self) {
        self.push(TelemetryEvent::AnimationStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.log(Severity::Progress, "starting");
        sink.progress(Phase::Run, 1, 3);
        sink.stop_animation();

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            TelemetryEvent::Log(Severity::Progress, "starting".to_string())
        );
        assert_eq!(events[2], TelemetryEvent::AnimationStopped);
    }

    #[test]
    fn test_messages_filters_by_severity() {
        let sink = RecordingSink::new();
        sink.log(Severity::Verbose, "noise");
        sink.log(Severity::Error, "boom");
        assert_eq!(sink.messages(Severity::Error), vec!["boom".to_string()]);
        assert!(sink.messages(Severity::Warning).is_empty());
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Progress.to_string(), "progress");
        assert_eq!(Severity::Fatal.to_string(), "fatal");
    }
}
