use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::artifact::{self, ArtifactState, HDF5_SIGNATURE};
use super::canonical::digest;
use super::record::{now_timestamp, CheckpointRecord};
use super::snapshot::{build_surgical_snapshot, SnapshotLayout};
use super::{CheckpointError, CheckpointResult};
use crate::collaborators::ConfigProvider;
use crate::progress::Phase;
use crate::work_unit::WorkUnit;

/// File names and checks for the artifacts of one work unit directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactLayout {
    /// Sidecar record file.
    pub record_file_name: String,
    /// Primary project artifact written by setup.
    pub project_file_name: String,
    /// Input artifact handed to the solver.
    pub input_file_name: String,
    /// Glob, relative to the unit directory, matching run outputs.
    pub run_output_pattern: String,
    /// Files, relative to the unit directory, written by extraction.
    pub extract_artifacts: Vec<String>,
    /// Hex signature the project artifact must start with. Empty disables
    /// the check.
    pub project_signature_hex: String,
    /// Allowed clock skew when comparing artifact times to the setup time.
    pub mtime_tolerance_ms: u64,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            record_file_name: "checkpoint.json".to_string(),
            project_file_name: "project.smash".to_string(),
            input_file_name: "project_Input.h5".to_string(),
            run_output_pattern: "**/*_Output.h5".to_string(),
            extract_artifacts: vec!["sar_results.json".to_string()],
            project_signature_hex: hex::encode(HDF5_SIGNATURE),
            mtime_tolerance_ms: 2_000,
        }
    }
}

/// Per-phase validity of a work unit's existing artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseValidity {
    pub setup_valid: bool,
    pub run_valid: bool,
    pub extract_valid: bool,
    /// State of the primary project artifact.
    pub primary: ArtifactState,
    /// Whether a readable, supported record matching the current digest exists.
    pub record_matches: bool,
}

impl PhaseValidity {
    fn none(primary: ArtifactState) -> Self {
        Self {
            setup_valid: false,
            run_valid: false,
            extract_valid: false,
            primary,
            record_matches: false,
        }
    }

    pub fn is_valid(&self, phase: Phase) -> bool {
        match phase {
            Phase::Setup => self.setup_valid,
            Phase::Run => self.run_valid,
            Phase::Extract => self.extract_valid,
        }
    }
}

/// Content-hash checkpoints for the results tree.
pub struct CheckpointStore {
    results_root: PathBuf,
    study: Arc<dyn ConfigProvider>,
    artifacts: ArtifactLayout,
    layout: SnapshotLayout,
    signature: Vec<u8>,
}

impl CheckpointStore {
    pub fn new(
        results_root: impl Into<PathBuf>,
        study: Arc<dyn ConfigProvider>,
        artifacts: ArtifactLayout,
        layout: SnapshotLayout,
    ) -> CheckpointResult<Self> {
        let signature = hex::decode(artifacts.project_signature_hex.trim())
            .map_err(|e| CheckpointError::InvalidSignature(e.to_string()))?;
        Ok(Self {
            results_root: results_root.into(),
            study,
            artifacts,
            layout,
            signature,
        })
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn artifacts(&self) -> &ArtifactLayout {
        &self.artifacts
    }

    pub fn unit_dir(&self, unit: &WorkUnit) -> PathBuf {
        unit.dir(&self.results_root)
    }

    pub fn project_path(&self, unit: &WorkUnit) -> PathBuf {
        self.unit_dir(unit).join(&self.artifacts.project_file_name)
    }

    pub fn input_path(&self, unit: &WorkUnit) -> PathBuf {
        self.unit_dir(unit).join(&self.artifacts.input_file_name)
    }

    pub fn record_path(&self, unit: &WorkUnit) -> PathBuf {
        self.unit_dir(unit).join(&self.artifacts.record_file_name)
    }

    pub fn build_surgical_snapshot(&self, unit: &WorkUnit) -> Value {
        build_surgical_snapshot(self.study.root(), unit, &self.layout)
    }

    /// Canonical digest of a snapshot.
    pub fn hash(&self, snapshot: &Value) -> String {
        digest(snapshot)
    }

    /// Read the sidecar record. Missing, unparsable and unknown-schema
    /// records all read as `None`.
    pub fn load_record(&self, unit: &WorkUnit) -> Option<CheckpointRecord> {
        let path = self.record_path(unit);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "unreadable checkpoint record");
                }
                return None;
            }
        };
        let record: CheckpointRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt checkpoint record");
                return None;
            }
        };
        if !record.is_supported() {
            warn!(
                path = %path.display(),
                schema_version = record.schema_version,
                "unsupported checkpoint schema"
            );
            return None;
        }
        Some(record)
    }

    /// Decide which phases of `unit` can be skipped.
    pub fn verify(&self, unit: &WorkUnit) -> PhaseValidity {
        let primary = artifact::inspect(&self.project_path(unit), self.signature());
        let Some(record) = self.load_record(unit) else {
            return PhaseValidity::none(primary);
        };

        let fresh = self.hash(&self.build_surgical_snapshot(unit));
        if record.config_hash != fresh {
            debug!(unit = %unit, "configuration changed since checkpoint");
            return PhaseValidity::none(primary);
        }

        let mut validity = PhaseValidity::none(primary);
        validity.record_matches = true;
        if !validity.primary.is_valid() {
            debug!(unit = %unit, primary = %validity.primary, "primary artifact not usable");
            return validity;
        }
        validity.setup_valid = true;

        validity.run_valid = record.run_done && self.run_outputs_valid(unit, record.setup_timestamp);
        validity.extract_valid =
            record.extract_done && self.extract_outputs_valid(unit, record.setup_timestamp);
        debug!(
            unit = %unit,
            setup = validity.setup_valid,
            run = validity.run_valid,
            extract = validity.extract_valid,
            "checkpoint verified"
        );
        validity
    }

    /// Persist completion of `phase` for `unit`.
    ///
    /// Setup starts a fresh record; run and extract update the record that
    /// setup wrote. The record is replaced atomically so a crash leaves either
    /// the old record or an unparsable temp file, never a false positive.
    pub fn write(&self, unit: &WorkUnit, phase: Phase) -> CheckpointResult<CheckpointRecord> {
        let hash = self.hash(&self.build_surgical_snapshot(unit));
        let now = now_timestamp();
        let record = match phase {
            Phase::Setup => CheckpointRecord::after_setup(hash, now),
            Phase::Run | Phase::Extract => {
                let mut record = self
                    .load_record(unit)
                    .filter(|record| record.config_hash == hash)
                    .ok_or_else(|| CheckpointError::NoSetupRecord {
                        unit: unit.to_string(),
                    })?;
                if phase == Phase::Run {
                    record.mark_run(now);
                } else {
                    record.mark_extract(now);
                }
                record
            }
        };
        self.write_record(unit, &record)?;
        debug!(unit = %unit, %phase, "checkpoint written");
        Ok(record)
    }

    /// Fail with [`CheckpointError::CorruptProject`] when the primary artifact
    /// exists but fails the structural check.
    pub fn check_primary(&self, unit: &WorkUnit) -> CheckpointResult<ArtifactState> {
        let path = self.project_path(unit);
        match artifact::inspect(&path, self.signature()) {
            ArtifactState::Corrupt { reason } => Err(CheckpointError::CorruptProject { path, reason }),
            state => Ok(state),
        }
    }

    /// Remove the project artifact, its run outputs and the record so the
    /// unit is rebuilt from scratch.
    pub fn discard(&self, unit: &WorkUnit) -> CheckpointResult<()> {
        let mut doomed = vec![self.project_path(unit), self.record_path(unit)];
        doomed.extend(self.run_outputs(unit)?);
        remove_all(doomed)?;
        info!(unit = %unit, "discarded stale artifacts");
        Ok(())
    }

    /// Remove run outputs left by an earlier setup before the scene is
    /// rebuilt. Returns how many were removed.
    pub fn clear_run_outputs(&self, unit: &WorkUnit) -> CheckpointResult<usize> {
        let removed = remove_all(self.run_outputs(unit)?)?;
        if removed > 0 {
            info!(unit = %unit, removed, "cleared run outputs of previous setup");
        }
        Ok(removed)
    }

    fn write_record(&self, unit: &WorkUnit, record: &CheckpointRecord) -> CheckpointResult<()> {
        let dir = self.unit_dir(unit);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(record)?;
        let path = self.record_path(unit);
        let temp_path = dir.join(format!("{}.tmp", self.artifacts.record_file_name));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn signature(&self) -> Option<&[u8]> {
        if self.signature.is_empty() {
            None
        } else {
            Some(&self.signature)
        }
    }

    fn is_fresh(&self, path: &Path, setup_timestamp: f64) -> bool {
        let tolerance = self.artifacts.mtime_tolerance_ms as f64 / 1000.0;
        artifact::modified_timestamp(path)
            .map(|modified| modified + tolerance >= setup_timestamp)
            .unwrap_or(false)
    }

    fn run_outputs(&self, unit: &WorkUnit) -> CheckpointResult<Vec<PathBuf>> {
        let dir = self.unit_dir(unit);
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            self.artifacts.run_output_pattern
        );
        let paths = glob::glob(&pattern)?.filter_map(Result::ok).collect();
        Ok(paths)
    }

    fn run_outputs_valid(&self, unit: &WorkUnit, setup_timestamp: f64) -> bool {
        let outputs = match self.run_outputs(unit) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(unit = %unit, error = %err, "invalid run output pattern");
                return false;
            }
        };
        // Outputs older than the setup belong to a previous configuration.
        let current: Vec<_> = outputs
            .iter()
            .filter(|path| self.is_fresh(path, setup_timestamp))
            .collect();
        !current.is_empty() && current.iter().all(|path| artifact::inspect(path, None).is_valid())
    }

    fn extract_outputs_valid(&self, unit: &WorkUnit, setup_timestamp: f64) -> bool {
        let dir = self.unit_dir(unit);
        !self.artifacts.extract_artifacts.is_empty()
            && self.artifacts.extract_artifacts.iter().all(|name| {
                let path = dir.join(name);
                artifact::inspect(&path, None).is_valid() && self.is_fresh(&path, setup_timestamp)
            })
    }
}

fn remove_all(paths: Vec<PathBuf>) -> CheckpointResult<usize> {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed stale artifact");
                removed += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(removed)
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("results_root", &self.results_root)
            .field("artifacts", &self.artifacts)
            .field("layout", &self.layout)
            .finish()
    }
}
