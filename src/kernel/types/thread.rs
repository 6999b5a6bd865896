use crate::kernel::memory::ContextHandle;
use crate::utils::sync::{Arc, AtomicBool, Condvar, Mutex, Ordering, Weak};
use serde::Serialize;

use super::{CoreId, CoreMask, GuestProcess, ObjectId, Priority, SyncObject, ThreadId};

/// Lifecycle state of a guest thread.
///
/// `Created -> Runnable <-> Running <-> Waiting -> Terminated`. Only the
/// scheduler moves a thread between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadStatus {
    /// Exists but was never started
    Created,
    /// Queued on a core behind the running thread
    Runnable,
    /// Front of its core's queue
    Running,
    /// Blocked on objects, or sleeping
    Waiting,
    /// Absorbing
    Terminated,
}

/// Scheduling fields, guarded by the thread's own lock.
///
/// This lock is a leaf: nothing else is acquired while it is held.
#[derive(Debug)]
pub(crate) struct SchedState {
    pub status: ThreadStatus,
    pub base_priority: Priority,
    /// Inherited priorities, one per owned mutex with waiters
    pub boosts: Vec<(ObjectId, Priority)>,
    /// `None` means "any core", with idle cores preferred
    pub ideal_core: Option<CoreId>,
    pub affinity: CoreMask,
    /// Core whose queue holds this thread, if any
    pub core: Option<CoreId>,
    pub held_mutexes: Vec<Weak<SyncObject>>,
}

impl SchedState {
    pub fn effective_priority(&self) -> Priority {
        self.boosts
            .iter()
            .map(|&(_, p)| p)
            .fold(self.base_priority, Priority::min)
    }

    /// Replaces the boost contributed by `object`. Returns whether the
    /// effective priority moved.
    ///
    /// A boost is kept even while it is less urgent than the base priority,
    /// so it applies again if the base priority is later lowered.
    pub fn set_boost(&mut self, object: ObjectId, boost: Option<Priority>) -> bool {
        let before = self.effective_priority();
        self.boosts.retain(|&(id, _)| id != object);
        if let Some(priority) = boost {
            self.boosts.push((object, priority));
        }
        before != self.effective_priority()
    }
}

/// How a blocked thread was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitWake {
    /// Index into the thread's target list
    Signaled(usize),
    TimedOut,
    Cancelled,
    Terminated,
}

/// The thread's pending wait, guarded by `GuestThread::wait`.
///
/// A wait is released exactly once: whoever stores `result` first (a waker,
/// the timeout, a canceller or a terminator) owns the release and makes the
/// thread runnable again. Everyone else finds the slot claimed and backs off.
#[derive(Debug, Default)]
pub(crate) struct WaitSlot {
    pub active: bool,
    pub sleeping: bool,
    pub targets: Vec<Arc<SyncObject>>,
    pub result: Option<WaitWake>,
}

impl WaitSlot {
    pub fn begin(&mut self, targets: Vec<Arc<SyncObject>>, sleeping: bool) {
        self.active = true;
        self.sleeping = sleeping;
        self.targets = targets;
        self.result = None;
    }

    pub fn is_claimable(&self) -> bool {
        self.active && self.result.is_none()
    }

    pub fn claim(&mut self, wake: WaitWake) -> bool {
        if self.is_claimable() {
            self.result = Some(wake);
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self) {
        self.active = false;
        self.sleeping = false;
        self.targets.clear();
        self.result = None;
    }
}

/// One guest execution context.
///
/// Owned by its [`GuestProcess`]; everything else (core queues, wait queues,
/// handle tables, mutex owners) holds shared references.
pub struct GuestThread {
    id: ThreadId,
    process: Weak<GuestProcess>,
    context: ContextHandle,
    entry: u64,
    argument: u64,
    stack_top: u64,
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) wait: Mutex<WaitSlot>,
    pub(crate) wait_cv: Condvar,
    /// Set when the thread must pass through the scheduler at its next safe point
    pub(crate) pending_yield: AtomicBool,
    pub(crate) terminate_requested: AtomicBool,
    /// One-shot cancellation delivered while not waiting
    pub(crate) cancel_pending: AtomicBool,
}

pub(crate) struct ThreadParams {
    pub id: ThreadId,
    pub process: Weak<GuestProcess>,
    pub context: ContextHandle,
    pub entry: u64,
    pub argument: u64,
    pub stack_top: u64,
    pub priority: Priority,
    pub ideal_core: Option<CoreId>,
    pub affinity: CoreMask,
}

impl GuestThread {
    pub(crate) fn new(params: ThreadParams) -> Self {
        Self {
            id: params.id,
            process: params.process,
            context: params.context,
            entry: params.entry,
            argument: params.argument,
            stack_top: params.stack_top,
            sched: Mutex::new(SchedState {
                status: ThreadStatus::Created,
                base_priority: params.priority,
                boosts: Vec::new(),
                ideal_core: params.ideal_core,
                affinity: params.affinity,
                core: None,
                held_mutexes: Vec::new(),
            }),
            wait: Mutex::new(WaitSlot::default()),
            wait_cv: Condvar::new(),
            pending_yield: AtomicBool::new(false),
            terminate_requested: AtomicBool::new(false),
            cancel_pending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn process(&self) -> Option<Arc<GuestProcess>> {
        self.process.upgrade()
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn argument(&self) -> u64 {
        self.argument
    }

    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }

    pub fn status(&self) -> ThreadStatus {
        self.sched.lock().status
    }

    pub fn base_priority(&self) -> Priority {
        self.sched.lock().base_priority
    }

    /// Base priority lowered by any inherited boosts.
    pub fn effective_priority(&self) -> Priority {
        self.sched.lock().effective_priority()
    }

    pub fn current_core(&self) -> Option<CoreId> {
        self.sched.lock().core
    }

    pub fn ideal_core(&self) -> Option<CoreId> {
        self.sched.lock().ideal_core
    }

    pub fn affinity(&self) -> CoreMask {
        self.sched.lock().affinity
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == ThreadStatus::Terminated
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::Acquire)
    }

    /// Mutexes currently owned by this thread.
    pub fn held_mutexes(&self) -> Vec<Arc<SyncObject>> {
        self.sched
            .lock()
            .held_mutexes
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Objects the thread is blocked on, empty unless it is in a wait.
    pub fn wait_targets(&self) -> Vec<Arc<SyncObject>> {
        let slot = self.wait.lock();
        if slot.active {
            slot.targets.clone()
        } else {
            Vec::new()
        }
    }

    pub fn is_sleeping(&self) -> bool {
        let slot = self.wait.lock();
        slot.active && slot.sleeping
    }

    pub(crate) fn add_held(&self, mutex: &Arc<SyncObject>) {
        self.sched.lock().held_mutexes.push(Arc::downgrade(mutex));
    }

    pub(crate) fn remove_held(&self, mutex: ObjectId) {
        self.sched
            .lock()
            .held_mutexes
            .retain(|m| m.upgrade().is_some_and(|m| m.id() != mutex));
    }

    pub(crate) fn take_held(&self) -> Vec<Arc<SyncObject>> {
        std::mem::take(&mut self.sched.lock().held_mutexes)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl std::fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.id)
            .field("entry", &format_args!("{:#x}", self.entry))
            .finish_non_exhaustive()
    }
}
