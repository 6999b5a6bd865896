//! Read-only views of kernel state for external reporting.
//!
//! Every snapshot is assembled one lock at a time, so it is a consistent view
//! of each core or object individually but not of the kernel as a whole.
use serde::Serialize;
use std::fmt;

use super::{
    metrics::MetricsSnapshot,
    types::{CoreId, ObjectId, ObjectKind, Priority, ProcessId, ProcessState, ThreadId, ThreadStatus},
};

#[derive(Debug, Clone, Serialize)]
pub struct CoreSnapshot {
    pub core: CoreId,
    pub running: Option<ThreadId>,
    /// Runnable threads in dispatch order
    pub runnable: Vec<ThreadId>,
}

impl CoreSnapshot {
    pub fn queue_len(&self) -> usize {
        self.runnable.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub time_slice_us: u64,
    pub cores: Vec<CoreSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub base_priority: Priority,
    pub effective_priority: Priority,
    pub core: Option<CoreId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub handles: usize,
    pub threads: Vec<ThreadSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub signaled: bool,
    pub owner: Option<ThreadId>,
    pub waiters: Vec<ThreadId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelSnapshot {
    pub scheduler: SchedulerSnapshot,
    pub processes: Vec<ProcessSnapshot>,
    pub objects: Vec<ObjectSnapshot>,
    pub metrics: MetricsSnapshot,
}

impl KernelSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for KernelSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Kernel Snapshot ===")?;
        writeln!(f, "Time slice: {}us", self.scheduler.time_slice_us)?;
        for core in &self.scheduler.cores {
            let running = core
                .running
                .map_or_else(|| "idle".to_string(), |t| t.to_string());
            writeln!(
                f,
                "  {:<6} running {:<6} queued {:?}",
                core.core.to_string(),
                running,
                core.runnable
            )?;
        }
        for process in &self.processes {
            writeln!(
                f,
                "{} \"{}\" {:?}, {} handle(s)",
                process.id, process.name, process.state, process.handles
            )?;
            for t in &process.threads {
                writeln!(
                    f,
                    "  {:<6} {:?} prio {} (base {})",
                    t.id.to_string(),
                    t.status,
                    t.effective_priority,
                    t.base_priority
                )?;
            }
        }
        for object in self.objects.iter().filter(|o| !o.waiters.is_empty()) {
            writeln!(
                f,
                "{} {:?}: {} waiter(s)",
                object.id,
                object.kind,
                object.waiters.len()
            )?;
        }
        write!(f, "{}", self.metrics)
    }
}
