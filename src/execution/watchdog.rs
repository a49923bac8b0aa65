//! Optional per-attempt time box.
//!
//! Disabled by default: the solver's own run time varies by orders of
//! magnitude between work units, so any limit is an integrator decision.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Limits checked on every monitoring iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Maximum wall time for one attempt, in seconds.
    pub max_attempt_secs: Option<u64>,
    /// Maximum time without a stdout line, in seconds.
    pub stall_timeout_secs: Option<u64>,
}

impl WatchdogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempt duration.
    pub fn with_max_attempt(mut self, limit: Duration) -> Self {
        self.max_attempt_secs = Some(limit.as_secs());
        self
    }

    /// Sets the stall timeout.
    pub fn with_stall_timeout(mut self, limit: Duration) -> Self {
        self.stall_timeout_secs = Some(limit.as_secs());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempt_secs.is_some() || self.stall_timeout_secs.is_some()
    }
}

/// Why the watchdog ended an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTrip {
    AttemptTimeout { elapsed_secs: u64, limit_secs: u64 },
    Stalled { silent_secs: u64, limit_secs: u64 },
}

impl std::fmt::Display for WatchdogTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogTrip::AttemptTimeout {
                elapsed_secs,
                limit_secs,
            } => write!(f, "attempt ran {}s (limit {}s)", elapsed_secs, limit_secs),
            WatchdogTrip::Stalled {
                silent_secs,
                limit_secs,
            } => write!(f, "no solver output for {}s (limit {}s)", silent_secs, limit_secs),
        }
    }
}

/// Watchdog state for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptWatchdog {
    max_attempt: Option<Duration>,
    stall_timeout: Option<Duration>,
    started: Instant,
    last_output: Instant,
}

impl AttemptWatchdog {
    pub fn start(config: WatchdogConfig) -> Self {
        Self::start_at(config, Instant::now())
    }

    fn start_at(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            max_attempt: config.max_attempt_secs.map(Duration::from_secs),
            stall_timeout: config.stall_timeout_secs.map(Duration::from_secs),
            started: now,
            last_output: now,
        }
    }

    /// Record that the solver produced output.
    pub fn pulse(&mut self) {
        self.last_output = Instant::now();
    }

    pub fn check(&self) -> Option<WatchdogTrip> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Option<WatchdogTrip> {
        if let Some(limit) = self.max_attempt {
            let elapsed = now.saturating_duration_since(self.started);
            if elapsed >= limit {
                return Some(WatchdogTrip::AttemptTimeout {
                    elapsed_secs: elapsed.as_secs(),
                    limit_secs: limit.as_secs(),
                });
            }
        }
        if let Some(limit) = self.stall_timeout {
            let silent = now.saturating_duration_since(self.last_output);
            if silent >= limit {
                return Some(WatchdogTrip::Stalled {
                    silent_secs: silent.as_secs(),
                    limit_secs: limit.as_secs(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let config = WatchdogConfig::default();
        assert!(!config.is_enabled());
        let watchdog = AttemptWatchdog::start_at(config, Instant::now());
        assert_eq!(
            watchdog.check_at(Instant::now() + Duration::from_secs(1_000_000)),
            None
        );
    }

    #[test]
    fn test_attempt_timeout_trips() {
        let now = Instant::now();
        let config = WatchdogConfig::new().with_max_attempt(Duration::from_secs(60));
        let watchdog = AttemptWatchdog::start_at(config, now);
        assert_eq!(watchdog.check_at(now + Duration::from_secs(59)), None);
        assert!(matches!(
            watchdog.check_at(now + Duration::from_secs(60)),
            Some(WatchdogTrip::AttemptTimeout { limit_secs: 60, .. })
        ));
    }

    #[test]
    fn test_stall_measured_from_last_output() {
        let now = Instant::now();
        let config = WatchdogConfig::new().with_stall_timeout(Duration::from_secs(10));
        let mut watchdog = AttemptWatchdog::start_at(config, now);
        watchdog.last_output = now + Duration::from_secs(8);
        assert_eq!(watchdog.check_at(now + Duration::from_secs(15)), None);
        assert!(matches!(
            watchdog.check_at(now + Duration::from_secs(18)),
            Some(WatchdogTrip::Stalled { .. })
        ));
    }

    #[test]
    fn test_trip_display() {
        let trip = WatchdogTrip::Stalled {
            silent_secs: 12,
            limit_secs: 10,
        };
        assert_eq!(trip.to_string(), "no solver output for 12s (limit 10s)");
    }
}
