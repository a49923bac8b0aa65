use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::phase::Phase;
use super::ProgressResult;

/// Durable timing knowledge shared by all sweep sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEstimates {
    /// Relative cost of each phase, keyed by phase name.
    #[serde(default)]
    pub phase_weights: BTreeMap<String, f64>,
    /// Expected seconds per subtask instance, keyed by subtask name.
    #[serde(default)]
    pub subtask_estimates: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for HistoricalEstimates {
    fn default() -> Self {
        let phase_weights = [
            (Phase::Setup, 0.25),
            (Phase::Run, 0.65),
            (Phase::Extract, 0.10),
        ]
        .into_iter()
        .map(|(phase, weight)| (phase.as_str().to_string(), weight))
        .collect();
        let subtask_estimates = [
            (Phase::Setup, 120.0),
            (Phase::Run, 1800.0),
            (Phase::Extract, 90.0),
        ]
        .into_iter()
        .map(|(phase, secs)| (phase.subtask().to_string(), secs))
        .collect();
        Self {
            phase_weights,
            subtask_estimates,
            updated_at: None,
        }
    }
}

impl HistoricalEstimates {
    /// Load estimates from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> ProgressResult<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Like [`load`](Self::load), but an unreadable file is logged and
    /// replaced by the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "ignoring unreadable historical estimates");
            Self::default()
        })
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> ProgressResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn phase_weight(&self, phase: Phase) -> Option<f64> {
        self.phase_weights
            .get(phase.as_str())
            .copied()
            .filter(|w| w.is_finite() && *w >= 0.0)
    }

    pub fn subtask_estimate(&self, subtask: &str) -> Option<f64> {
        self.subtask_estimates
            .get(subtask)
            .copied()
            .filter(|s| s.is_finite() && *s >= 0.0)
    }
}
