//! Ownership of one external solver process.
//!
//! A single background thread performs the only blocking read in the system:
//! it reads stdout line by line and pushes each line onto an unbounded
//! channel. The controller polls the channel and never touches the pipe.
//! Stderr goes to a log file so it can never fill up and stall the solver.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::{ExecutionError, ExecutionResult};

/// How long `read_all_remaining_lines` waits for the reader to hit EOF.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const TERMINATE_POLL: Duration = Duration::from_millis(20);

/// Windows process creation flag that suppresses a console window.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Command line for one solver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl SolverCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Build the `solver_binary -i <input> [flags]` invocation.
    pub fn solver(program: impl Into<PathBuf>, input: &Path, flags: &[String]) -> Self {
        let mut command = Self::new(program);
        command.args.push("-i".to_string());
        command.args.push(input.display().to_string());
        command.args.extend(flags.iter().cloned());
        command
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Owner of one external process plus its stdout reader thread.
///
/// All methods take `&self` so the manager can be shared through an `Arc`
/// with the engine's process registry.
#[derive(Debug)]
pub struct ProcessManager {
    child: Mutex<Option<Child>>,
    lines: Mutex<Option<Receiver<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    exit_code: Mutex<Option<i32>>,
    stderr_path: Option<PathBuf>,
    cleaned_up: AtomicBool,
}

impl ProcessManager {
    /// Create a manager. When `stderr_path` is set, stderr of the process is
    /// written there; otherwise it is discarded.
    pub fn new(stderr_path: Option<PathBuf>) -> Self {
        Self {
            child: Mutex::new(None),
            lines: Mutex::new(None),
            reader: Mutex::new(None),
            exit_code: Mutex::new(None),
            stderr_path,
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Spawn the process and its reader thread. Never blocks on process IO.
    pub fn start(&self, command: &SolverCommand) -> ExecutionResult<()> {
        let start_failed = |source: io::Error| ExecutionError::StartFailed {
            command: command.display(),
            source,
        };

        let stderr = match &self.stderr_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(start_failed)?;
                }
                Stdio::from(File::create(path).map_err(start_failed)?)
            }
            None => Stdio::null(),
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(start_failed)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            start_failed(io::Error::new(io::ErrorKind::Other, "stdout was not captured"))
        })?;

        let (sender, receiver) = mpsc::channel::<String>();
        let reader = thread::Builder::new()
            .name("solver-stdout".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if sender.send(line).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "stdout reader stopped");
                            break;
                        }
                    }
                }
            })
            .map_err(start_failed)?;

        debug!(pid = child.id(), command = %command.display(), "solver process started");

        self.cleaned_up.store(false, Ordering::SeqCst);
        lock(&self.exit_code).take();
        *lock(&self.lines) = Some(receiver);
        *lock(&self.reader) = Some(reader);
        *lock(&self.child) = Some(child);
        Ok(())
    }

    /// Process id, if a process is owned.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().map(Child::id)
    }

    /// True iff a process is owned and has not exited.
    pub fn is_running(&self) -> bool {
        let mut guard = lock(&self.child);
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                *lock(&self.exit_code) = status.code();
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(error = %err, "failed to poll solver process");
                false
            }
        }
    }

    /// Exit code once the process has exited. `None` while running or when it
    /// was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        if let Some(code) = *lock(&self.exit_code) {
            return Some(code);
        }
        let mut guard = lock(&self.child);
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code();
                *lock(&self.exit_code) = code;
                code
            }
            _ => None,
        }
    }

    /// Drain everything currently queued without blocking.
    pub fn read_available_lines(&self) -> Vec<String> {
        let guard = lock(&self.lines);
        let Some(receiver) = guard.as_ref() else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        lines
    }

    /// Collect every line still in flight after the process exited.
    ///
    /// The reader may still be pushing lines that the controller has not seen
    /// yet. This waits until the reader drops its end of the channel (EOF) or
    /// `timeout` elapses, then joins the reader if it finished.
    pub fn read_all_remaining_lines(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        {
            let guard = lock(&self.lines);
            if let Some(receiver) = guard.as_ref() {
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(remaining) {
                        Ok(line) => lines.push(line),
                        Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(
                                timeout_ms = timeout.as_millis() as u64,
                                "stdout reader did not reach EOF in time"
                            );
                            // Take whatever arrived in the meantime.
                            while let Ok(line) = receiver.try_recv() {
                                lines.push(line);
                            }
                            break;
                        }
                    }
                }
            }
        }
        self.join_reader_if_finished();
        lines
    }

    /// Best-effort read of the stderr log. The solver reports errors on stdout
    /// primarily, so this is only a fallback for diagnostics.
    pub fn read_stderr(&self) -> String {
        match &self.stderr_path {
            Some(path) => fs::read_to_string(path).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Ask the process to stop, escalating to a forced kill after `timeout`.
    pub fn terminate(&self, timeout: Duration) {
        let mut guard = lock(&self.child);
        let Some(child) = guard.as_mut() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            *lock(&self.exit_code) = status.code();
            return;
        }

        request_stop(child);

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    *lock(&self.exit_code) = status.code();
                    debug!(pid = child.id(), "solver process stopped");
                    return;
                }
                Ok(None) => thread::sleep(TERMINATE_POLL),
                Err(_) => break,
            }
        }

        warn!(pid = child.id(), "solver did not stop in time, killing");
        if let Err(err) = child.kill() {
            debug!(error = %err, "kill failed, process likely gone");
        }
        if let Ok(status) = child.wait() {
            *lock(&self.exit_code) = status.code();
        }
    }

    /// Release the process and reader. Idempotent and safe to call from any
    /// unwinding path; returns true only for the call that did the work.
    pub fn cleanup(&self) -> bool {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(mut child) = lock(&self.child).take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    *lock(&self.exit_code) = status.code();
                }
                _ => {
                    let _ = child.kill();
                    if let Ok(status) = child.wait() {
                        *lock(&self.exit_code) = status.code();
                    }
                }
            }
        }

        // Dropping the receiver makes a still-running reader stop on its next send.
        lock(&self.lines).take();
        self.join_reader_if_finished();
        true
    }

    fn join_reader_if_finished(&self) {
        let mut guard = lock(&self.reader);
        let finished = guard.as_ref().map(JoinHandle::is_finished).unwrap_or(false);
        if finished {
            if let Some(handle) = guard.take() {
                if handle.join().is_err() {
                    warn!("stdout reader thread panicked");
                }
            }
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    // SIGTERM lets the solver flush its output files before exiting.
    let pid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.kill();
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
/// `cleanup` must keep working on unwinding paths.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
