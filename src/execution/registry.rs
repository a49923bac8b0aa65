use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use super::process::ProcessManager;

/// Identifier handed out by [`ProcessRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Live processes owned by one execution engine.
///
/// Each attempt registers its process before monitoring and deregisters it
/// afterwards. `terminate_all` is the forced-exit hook: it is what a Ctrl-C
/// handler or host shutdown calls to make sure no solver outlives the engine.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    processes: HashMap<u64, Arc<ProcessManager>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, process: Arc<ProcessManager>) -> RegistrationId {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.processes.insert(id, process);
        RegistrationId(id)
    }

    /// Remove a process. Unknown ids are ignored.
    pub fn deregister(&self, id: RegistrationId) {
        self.state().processes.remove(&id.0);
    }

    /// Number of processes currently registered.
    pub fn len(&self) -> usize {
        self.state().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate and clean up every registered process.
    ///
    /// Returns how many processes were registered at the time of the call.
    pub fn terminate_all(&self, timeout: Duration) -> usize {
        let processes: Vec<Arc<ProcessManager>> = {
            let mut state = self.state();
            state.processes.drain().map(|(_, process)| process).collect()
        };
        for process in &processes {
            process.terminate(timeout);
            process.cleanup();
        }
        if !processes.is_empty() {
            info!(count = processes.len(), "terminated registered solver processes");
        }
        processes.len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
