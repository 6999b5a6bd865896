use crate::kernel::handle_table::HandleTable;
use crate::utils::sync::{Arc, Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::time::Duration;

use super::{CoreId, GuestThread, ProcessId, SyncObject, ThreadId, ThreadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Running,
    /// Teardown in progress; no new threads may be created
    Exiting,
    Exited,
}

#[derive(Debug)]
pub(crate) struct ProcessLife {
    pub state: ProcessState,
    /// Every thread that has not terminated yet
    pub threads: Vec<Arc<GuestThread>>,
}

/// A guest process: the exclusive owner of its threads and of one handle
/// table.
pub struct GuestProcess {
    id: ProcessId,
    name: String,
    default_core: CoreId,
    life: Mutex<ProcessLife>,
    /// Notified whenever a thread of this process terminates
    thread_exited: Condvar,
    handles: Mutex<HandleTable>,
    exit_signal: Arc<SyncObject>,
}

impl GuestProcess {
    pub(crate) fn new(
        id: ProcessId,
        name: impl Into<String>,
        default_core: CoreId,
        handle_capacity: usize,
        exit_signal: Arc<SyncObject>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            default_core,
            life: Mutex::new(ProcessLife {
                state: ProcessState::Running,
                threads: Vec::new(),
            }),
            thread_exited: Condvar::new(),
            handles: Mutex::new(HandleTable::new(handle_capacity)),
            exit_signal,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_core(&self) -> CoreId {
        self.default_core
    }

    pub fn state(&self) -> ProcessState {
        self.life.lock().state
    }

    /// Signaled exactly once, when the process has no live threads left.
    pub fn exit_signal(&self) -> &Arc<SyncObject> {
        &self.exit_signal
    }

    pub fn threads(&self) -> Vec<Arc<GuestThread>> {
        self.life.lock().threads.clone()
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<GuestThread>> {
        self.life
            .lock()
            .threads
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    pub fn live_thread_count(&self) -> usize {
        self.life.lock().threads.len()
    }

    pub(crate) fn life(&self) -> MutexGuard<'_, ProcessLife> {
        self.life.lock()
    }

    pub(crate) fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock()
    }

    /// Drop a terminated thread from the live set. Returns `None` if it was
    /// already gone, otherwise whether it was the last one.
    pub(crate) fn forget_thread(&self, thread: ThreadId) -> Option<bool> {
        let mut life = self.life.lock();
        let before = life.threads.len();
        life.threads.retain(|t| t.id() != thread);
        if before == life.threads.len() {
            return None;
        }
        self.thread_exited.notify_all();
        Some(life.threads.is_empty())
    }

    /// Block until every thread other than `except` has terminated, or until
    /// `timeout` passes. Returns the ids still alive.
    pub(crate) fn wait_threads_exited(
        &self,
        except: Option<ThreadId>,
        timeout: Duration,
    ) -> Vec<ThreadId> {
        let alive = |life: &ProcessLife| -> Vec<ThreadId> {
            life.threads
                .iter()
                .filter(|t| Some(t.id()) != except && t.status() != ThreadStatus::Terminated)
                .map(|t| t.id())
                .collect()
        };

        let mut life = self.life.lock();
        let remaining = alive(&life);
        if remaining.is_empty() {
            return remaining;
        }
        self.thread_exited.wait_for(&mut life, timeout);
        alive(&life)
    }
}

impl std::fmt::Debug for GuestProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
