use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current sidecar schema version. Records with any other version are ignored.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Per-work-unit sidecar metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Digest of the surgical snapshot the artifacts were produced from.
    pub config_hash: String,
    pub schema_version: u32,
    /// Seconds since the Unix epoch when setup finished.
    pub setup_timestamp: f64,
    pub run_done: bool,
    pub extract_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_timestamp: Option<f64>,
}

impl CheckpointRecord {
    /// Record for freshly completed setup. Downstream phases start undone.
    pub fn after_setup(config_hash: impl Into<String>, setup_timestamp: f64) -> Self {
        Self {
            config_hash: config_hash.into(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            setup_timestamp,
            run_done: false,
            extract_done: false,
            run_timestamp: None,
            extract_timestamp: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.schema_version == CHECKPOINT_SCHEMA_VERSION
    }

    /// A new run invalidates any previous extraction.
    pub fn mark_run(&mut self, timestamp: f64) {
        self.run_done = true;
        self.run_timestamp = Some(timestamp);
        self.extract_done = false;
        self.extract_timestamp = None;
    }

    pub fn mark_extract(&mut self, timestamp: f64) {
        self.extract_done = true;
        self.extract_timestamp = Some(timestamp);
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
