//! Command-line stand-ins for the external collaborators.
//!
//! The `sweep` binary has no scene builder or post-processor of its own, so it
//! delegates to configured hook commands and treats the project document as
//! plain files on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::Value;
use tracing::debug;

use crate::collaborators::{CollaboratorError, ProjectDocument, ResultsExtractor, SceneBuilder};
use crate::work_unit::WorkUnit;

/// File the setup hook receives the surgical snapshot in.
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";

/// A program plus arguments with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    name: &'static str,
    argv: Vec<String>,
}

impl HookCommand {
    pub fn new(name: &'static str, argv: Vec<String>) -> Self {
        Self { name, argv }
    }

    pub fn is_configured(&self) -> bool {
        !self.argv.is_empty()
    }

    /// Substitute placeholders for `unit`.
    pub fn render(&self, unit: &WorkUnit, project: &Path, unit_dir: &Path) -> Vec<String> {
        let snapshot = unit_dir.join(SNAPSHOT_FILE_NAME);
        let replacements = [
            ("{unit_dir}", unit_dir.to_string_lossy().to_string()),
            ("{project}", project.to_string_lossy().to_string()),
            ("{snapshot}", snapshot.to_string_lossy().to_string()),
            ("{entity}", unit.entity.clone()),
            ("{frequency_mhz}", unit.frequency_mhz.to_string()),
            ("{scenario}", unit.scenario.clone()),
            ("{position}", unit.position.clone()),
            ("{orientation}", unit.orientation.clone()),
        ];
        self.argv
            .iter()
            .map(|arg| {
                replacements
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }

    /// Run to completion in `unit_dir`. A non-zero exit is an error carrying
    /// the hook's stderr.
    pub fn run(&self, unit: &WorkUnit, project: &Path, unit_dir: &Path) -> Result<(), CollaboratorError> {
        let argv = self.render(unit, project, unit_dir);
        let Some((program, args)) = argv.split_first() else {
            return Err(CollaboratorError::new(self.name, "no hook command configured"));
        };
        debug!(hook = self.name, command = %argv.join(" "), "running hook");
        let output = Command::new(program)
            .args(args)
            .current_dir(unit_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CollaboratorError::new(self.name, format!("failed to start {}: {}", program, e)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CollaboratorError::new(
            self.name,
            format!(
                "{} exited with {}: {}",
                program,
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            ),
        ))
    }
}

/// Writes the snapshot next to the project, then runs the setup hook.
#[derive(Debug, Clone)]
pub struct CommandSceneBuilder {
    hook: HookCommand,
}

impl CommandSceneBuilder {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            hook: HookCommand::new("setup hook", argv),
        }
    }
}

impl SceneBuilder for CommandSceneBuilder {
    fn build(&mut self, unit: &WorkUnit, snapshot: &Value, project_path: &Path) -> Result<(), CollaboratorError> {
        let unit_dir = parent_dir(project_path);
        let text = serde_json::to_string_pretty(snapshot)
            .map_err(|e| CollaboratorError::new("setup hook", e.to_string()))?;
        fs::write(unit_dir.join(SNAPSHOT_FILE_NAME), text)
            .map_err(|e| CollaboratorError::new("setup hook", e.to_string()))?;
        self.hook.run(unit, project_path, &unit_dir)
    }
}

/// Runs the extraction hook in the unit directory.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    hook: HookCommand,
}

impl CommandExtractor {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            hook: HookCommand::new("extract hook", argv),
        }
    }
}

impl ResultsExtractor for CommandExtractor {
    fn extract(&mut self, unit: &WorkUnit, project_path: &Path, unit_dir: &Path) -> Result<(), CollaboratorError> {
        self.hook.run(unit, project_path, unit_dir)
    }
}

/// Project document backed by the filesystem. A result exists when the result
/// name, read as a glob relative to the project's directory, matches a file.
#[derive(Debug, Clone, Default)]
pub struct FsProjectDocument {
    open: Option<PathBuf>,
}

impl FsProjectDocument {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectDocument for FsProjectDocument {
    fn close(&mut self) -> Result<(), CollaboratorError> {
        self.open = None;
        Ok(())
    }

    fn open(&mut self, project_path: &Path) -> Result<(), CollaboratorError> {
        if !project_path.is_file() {
            return Err(CollaboratorError::new(
                "project document",
                format!("{} does not exist", project_path.display()),
            ));
        }
        self.open = Some(project_path.to_path_buf());
        Ok(())
    }

    fn has_result(&self, name: &str) -> bool {
        let Some(project) = &self.open else {
            return false;
        };
        let dir = parent_dir(project);
        let pattern = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), name);
        match glob::glob(&pattern) {
            Ok(mut paths) => paths.any(|entry| entry.map(|path| path.is_file()).unwrap_or(false)),
            Err(_) => false,
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
