//! Host keep-awake during long unattended runs.
//!
//! Best-effort convenience: failures are logged and otherwise ignored.

use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::collaborators::CollaboratorError;

/// Collaborator name carried by keep-awake failures.
const KEEP_AWAKE: &str = "keep-awake";

/// A side effect that prevents the host from sleeping.
pub trait KeepAwake: Send {
    /// Engage the keep-awake effect. Called at most once per attempt sequence.
    fn engage(&mut self) -> Result<(), CollaboratorError>;
}

/// Does nothing. Used when keep-awake is disabled.
#[derive(Debug, Default)]
pub struct NoKeepAwake;

impl KeepAwake for NoKeepAwake {
    fn engage(&mut self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Spawns the platform's sleep inhibitor tied to this process's lifetime:
/// `systemd-inhibit` on Linux, `caffeinate` on macOS. Other platforms are a
/// no-op.
#[derive(Debug, Default)]
pub struct CommandKeepAwake {
    inhibitor: Option<Child>,
}

impl CommandKeepAwake {
    pub fn new() -> Self {
        Self::default()
    }

    fn inhibitor_command() -> Option<Command> {
        let pid = std::process::id().to_string();
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("caffeinate");
            cmd.args(["-i", "-w", pid.as_str()]);
            Some(cmd)
        } else if cfg!(target_os = "linux") {
            let mut cmd = Command::new("systemd-inhibit");
            cmd.args([
                "--what=idle:sleep",
                "--who=solver-sweep",
                "--why=long-running solver sweep",
                "--mode=block",
                "tail",
                "--pid",
                pid.as_str(),
                "-f",
                "/dev/null",
            ]);
            Some(cmd)
        } else {
            None
        }
    }
}

impl KeepAwake for CommandKeepAwake {
    fn engage(&mut self) -> Result<(), CollaboratorError> {
        if self.inhibitor.is_some() {
            return Ok(());
        }
        let Some(mut cmd) = Self::inhibitor_command() else {
            debug!("no keep-awake mechanism on this platform");
            return Ok(());
        };
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                CollaboratorError::new(KEEP_AWAKE, format!("failed to start sleep inhibitor: {}", e))
            })?;
        self.inhibitor = Some(child);
        Ok(())
    }
}

impl Drop for CommandKeepAwake {
    fn drop(&mut self) {
        if let Some(mut child) = self.inhibitor.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Which hook fired the keep-awake effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAwakeTrigger {
    BeforeRetry,
    FirstProgress,
}

/// Fires a [`KeepAwake`] effect at most once per attempt sequence, on the
/// first of: the start of a retry, or the first progress sample.
pub struct KeepAwakeHandler {
    effect: Box<dyn KeepAwake>,
    triggered: bool,
}

impl KeepAwakeHandler {
    pub fn new(effect: Box<dyn KeepAwake>) -> Self {
        Self {
            effect,
            triggered: false,
        }
    }

    /// Handler that never does anything.
    pub fn disabled() -> Self {
        Self::new(Box::new(NoKeepAwake))
    }

    /// Hook run on every `Idle -> Starting` transition. Fires only for retries.
    pub fn before_attempt(&mut self, attempt: u32) -> bool {
        if attempt <= 1 {
            return false;
        }
        self.fire(KeepAwakeTrigger::BeforeRetry)
    }

    /// Hook run on each progress sample.
    pub fn on_progress(&mut self) -> bool {
        self.fire(KeepAwakeTrigger::FirstProgress)
    }

    pub fn has_triggered(&self) -> bool {
        self.triggered
    }

    /// Re-arm for the next work unit.
    pub fn reset(&mut self) {
        self.triggered = false;
    }

    fn fire(&mut self, trigger: KeepAwakeTrigger) -> bool {
        if self.triggered {
            return false;
        }
        self.triggered = true;
        match self.effect.engage() {
            Ok(()) => info!(?trigger, "keep-awake engaged"),
            Err(err) => warn!(?trigger, error = %err, "keep-awake failed, continuing"),
        }
        true
    }
}

impl std::fmt::Debug for KeepAwakeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAwakeHandler")
            .field("triggered", &self.triggered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingKeepAwake {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    impl KeepAwake for CountingKeepAwake {
        fn engage(&mut self) -> Result<(), CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CollaboratorError::new(KEEP_AWAKE, "inhibitor missing"))
            } else {
                Ok(())
            }
        }
    }

    fn handler(fail: bool) -> (KeepAwakeHandler, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let effect = CountingKeepAwake {
            calls: Arc::clone(&calls),
            fail,
        };
        (KeepAwakeHandler::new(Box::new(effect)), calls)
    }

    #[test]
    fn test_first_attempt_does_not_trigger() {
        let (mut handler, calls) = handler(false);
        assert!(!handler.before_attempt(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_progress_triggers_once() {
        let (mut handler, calls) = handler(false);
        assert!(handler.on_progress());
        assert!(!handler.on_progress());
        assert!(!handler.before_attempt(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_triggers_before_progress() {
        let (mut handler, calls) = handler(false);
        handler.before_attempt(1);
        assert!(handler.before_attempt(2));
        assert!(!handler.on_progress());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_swallowed() {
        let (mut handler, calls) = handler(true);
        assert!(handler.on_progress());
        assert!(handler.has_triggered());
        assert!(!handler.on_progress());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_engage_error_names_collaborator() {
        let mut effect = CountingKeepAwake {
            calls: Arc::new(AtomicU32::new(0)),
            fail: true,
        };
        let err = effect.engage().unwrap_err();
        assert_eq!(err.collaborator, "keep-awake");
        assert_eq!(err.to_string(), "keep-awake: inhibitor missing");
        assert!(NoKeepAwake.engage().is_ok());
    }

    #[test]
    fn test_reset_rearms() {
        let (mut handler, calls) = handler(false);
        handler.on_progress();
        handler.reset();
        handler.on_progress();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
