//! Structural checks for artifacts referenced by a checkpoint.

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Default project container signature (HDF5 superblock).
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0d, 0x0a, 0x1a, 0x0a];

/// Outcome of inspecting one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    Valid,
    /// Another process holds the artifact's lock file.
    Locked,
    Corrupt { reason: String },
}

impl ArtifactState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ArtifactState::Valid)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, ArtifactState::Corrupt { .. })
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactState::Missing => f.write_str("missing"),
            ArtifactState::Valid => f.write_str("valid"),
            ArtifactState::Locked => f.write_str("locked"),
            ArtifactState::Corrupt { reason } => write!(f, "corrupt ({})", reason),
        }
    }
}

/// `<artifact>.lock`, the sibling a writer holds while the artifact is open.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Check that `path` exists, is not locked, is readable, non-empty and, when
/// `signature` is given, starts with it.
pub fn inspect(path: &Path, signature: Option<&[u8]>) -> ArtifactState {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return ArtifactState::Missing,
        Err(err) => {
            return ArtifactState::Corrupt {
                reason: format!("unreadable metadata: {}", err),
            }
        }
    };
    if lock_path(path).exists() {
        return ArtifactState::Locked;
    }
    if !metadata.is_file() {
        return ArtifactState::Corrupt {
            reason: "not a regular file".to_string(),
        };
    }
    if metadata.len() == 0 {
        return ArtifactState::Corrupt {
            reason: "empty file".to_string(),
        };
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            return ArtifactState::Corrupt {
                reason: format!("cannot open: {}", err),
            }
        }
    };
    if let Some(signature) = signature.filter(|s| !s.is_empty()) {
        let mut header = vec![0u8; signature.len()];
        if file.read_exact(&mut header).is_err() || header != signature {
            return ArtifactState::Corrupt {
                reason: "bad file signature".to_string(),
            };
        }
    }
    ArtifactState::Valid
}

/// Modification time as seconds since the Unix epoch.
pub fn modified_timestamp(path: &Path) -> Option<f64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_secs_f64())
}
