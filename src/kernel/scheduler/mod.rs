//! Multi-core priority scheduler.
//!
//! Every guest thread is backed by its own host thread. A virtual core is a
//! run queue whose front entry is the thread allowed to execute; every other
//! thread assigned to the core parks in [`Scheduler::wait_schedule`] until it
//! reaches the front. Switching threads is therefore just reordering a queue
//! and notifying the core's condition variable.
//!
//! # Preemption
//!
//! A running thread is never stopped from outside. When it must give up its
//! core, the scheduler sets its `pending_yield` flag and asks the execution
//! engine to interrupt it. The engine guarantees it calls
//! [`Scheduler::safe_point`] at instruction-block boundaries and after every
//! supervisor call; only there is the thread rotated, migrated or terminated,
//! and its execution context is considered saved at that point.
//!
//! # Lock ordering
//!
//! 1. sync-object locks, ascending `ObjectId`
//! 2. a thread's wait slot
//! 3. core queue locks, ascending core index
//! 4. a thread's scheduling state (leaf)
//!
//! No thread holds a core lock while acquiring an object lock. A thread
//! entering a wait holds its target objects' locks until it is off its core,
//! so no waker can observe it half-way.
use crate::kernel::{
    config::KernelConfig,
    engine::ExecutionEngine,
    error::{KernelError, KernelResult},
    metrics::SchedulerMetrics,
    snapshot::{CoreSnapshot, SchedulerSnapshot},
    tracer::Tracer,
    types::{
        thread::SchedState, CoreId, CoreMask, GuestThread, Priority, ThreadId, ThreadStatus,
        LOWEST_PRIORITY,
    },
};
use crate::utils::sync::{Arc, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

mod queue;
mod wait;

pub(crate) use queue::Placement;
use queue::{Core, CoreQueue};

pub struct Scheduler {
    cores: Vec<Core>,
    time_slice: Duration,
    max_wait_objects: usize,
    inheritance_depth_limit: usize,
    engine: Arc<dyn ExecutionEngine>,
    metrics: Arc<SchedulerMetrics>,
    tracer: Arc<Tracer>,
}

impl Scheduler {
    pub fn new(
        config: &KernelConfig,
        engine: Arc<dyn ExecutionEngine>,
        metrics: Arc<SchedulerMetrics>,
        tracer: Arc<Tracer>,
    ) -> Self {
        Self {
            cores: (0..config.core_count).map(|i| Core::new(CoreId(i))).collect(),
            time_slice: config.time_slice,
            max_wait_objects: config.max_wait_objects,
            inheritance_depth_limit: config.inheritance_depth_limit,
            engine,
            metrics,
            tracer,
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn time_slice(&self) -> Duration {
        self.time_slice
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    fn core(&self, id: CoreId) -> &Core {
        match self.cores.get(id.index()) {
            Some(core) => core,
            None => crate::invariant_violation!("{} does not exist", id),
        }
    }

    /// The thread currently allowed to execute on `core`.
    pub fn running_on(&self, core: CoreId) -> Option<Arc<GuestThread>> {
        self.cores
            .get(core.index())
            .and_then(|c| c.queue.lock().front().cloned())
    }

    /// Runnable threads queued behind the running one, in dispatch order.
    pub fn runnable_on(&self, core: CoreId) -> Vec<ThreadId> {
        self.cores
            .get(core.index())
            .map(|c| c.queue.lock().runnable_ids())
            .unwrap_or_default()
    }

    /// Pick the core a thread should be queued on.
    ///
    /// An explicit preference inside the mask wins. With no preference ("any
    /// core") an idle permitted core is preferred. Otherwise the lowest
    /// permitted core is used.
    pub fn select_core(&self, preferred: Option<CoreId>, mask: CoreMask) -> Option<CoreId> {
        let count = self.cores.len();
        let mut permitted = mask.cores().take_while(|c| c.index() < count);
        match preferred {
            Some(core) if core.index() < count && mask.contains(core) => Some(core),
            Some(_) => permitted.next(),
            None => {
                let permitted: Vec<CoreId> = permitted.collect();
                permitted
                    .iter()
                    .copied()
                    .find(|&c| self.core(c).queue.lock().threads.is_empty())
                    .or_else(|| permitted.first().copied())
            }
        }
    }

    /// Queue a created thread on `preferred` (or its ideal core) if permitted,
    /// else on the lowest permitted core. Preempts the core's running thread
    /// if the new one is more urgent.
    pub fn add_thread(
        &self,
        thread: &Arc<GuestThread>,
        preferred: Option<CoreId>,
    ) -> KernelResult<CoreId> {
        let (status, ideal, mask) = {
            let s = thread.sched.lock();
            (s.status, s.ideal_core, s.affinity)
        };
        if status != ThreadStatus::Created {
            return Err(KernelError::InvalidState("thread was already started"));
        }
        let core = self
            .select_core(preferred.or(ideal), mask)
            .ok_or(KernelError::InvalidCoreId(-1))?;
        if !self.enqueue(thread, core, Placement::BackOfBand, ThreadStatus::Created) {
            return Err(KernelError::InvalidState("thread was already started"));
        }
        self.tracer.trace_thread_start(thread.id(), core);
        Ok(core)
    }

    /// Put `thread` on `core_id` if its status is `expected`. Returns `false`
    /// when the thread has moved on (typically: terminated).
    fn enqueue(
        &self,
        thread: &Arc<GuestThread>,
        core_id: CoreId,
        placement: Placement,
        expected: ThreadStatus,
    ) -> bool {
        let core = self.core(core_id);
        let mut q = core.queue.lock();
        let priority = {
            let mut s = thread.sched.lock();
            if s.status != expected {
                return false;
            }
            if let Some(other) = s.core {
                crate::invariant_violation!(
                    "{} is {:?} but still queued on {}",
                    thread.id(),
                    s.status,
                    other
                );
            }
            s.status = ThreadStatus::Runnable;
            s.core = Some(core_id);
            s.effective_priority()
        };
        self.insert(core, &mut q, thread, priority, placement);
        true
    }

    fn insert(
        &self,
        core: &Core,
        q: &mut CoreQueue,
        thread: &Arc<GuestThread>,
        priority: Priority,
        placement: Placement,
    ) {
        if q.threads.is_empty() {
            q.threads.push_back(thread.clone());
            self.promote_front(core, q, None);
            return;
        }
        let at = q.insertion_point(priority, placement, 1);
        q.threads.insert(at, thread.clone());
        self.check_preemption(core, q);
    }

    /// Ask the running thread to yield if the next runnable one is more urgent.
    fn check_preemption(&self, core: &Core, q: &CoreQueue) {
        let (Some(front), Some(next)) = (q.threads.front(), q.threads.get(1)) else {
            return;
        };
        if next.effective_priority() < front.effective_priority() {
            self.request_preemption(core.id, front, "higher priority runnable");
        }
    }

    fn request_preemption(&self, core: CoreId, thread: &GuestThread, reason: &str) {
        if !thread.pending_yield.swap(true, Ordering::AcqRel) {
            self.metrics.record_preemption_request();
            self.tracer.trace_preempt(core, thread.id(), reason);
            self.engine.interrupt(thread);
        }
    }

    /// The front of `q` changed: mark it running, restart the slice and wake
    /// every thread parked on this core so the new front can proceed.
    fn promote_front(&self, core: &Core, q: &mut CoreQueue, previous: Option<ThreadId>) {
        q.slice_start = Instant::now();
        let next = q.front().map(|t| {
            t.sched.lock().status = ThreadStatus::Running;
            t.pending_yield.store(false, Ordering::Release);
            t.id()
        });
        self.metrics.record_context_switch();
        self.tracer.trace_switch(core.id, previous, next);
        core.front_changed.notify_all();
    }

    /// Park the calling host thread until `thread` is the front of its core.
    pub fn wait_schedule(&self, thread: &GuestThread) -> KernelResult<CoreId> {
        loop {
            let core_id = {
                let s = thread.sched.lock();
                match (s.status, s.core) {
                    (ThreadStatus::Terminated, _) => {
                        return Err(KernelError::TerminationRequested)
                    }
                    (_, Some(core)) => core,
                    (status, None) => crate::invariant_violation!(
                        "{} is {:?} but on no core while awaiting dispatch",
                        thread.id(),
                        status
                    ),
                }
            };
            let core = self.core(core_id);
            let mut q = core.queue.lock();
            {
                let s = thread.sched.lock();
                if s.status == ThreadStatus::Terminated {
                    return Err(KernelError::TerminationRequested);
                }
                if s.core != Some(core_id) {
                    continue;
                }
            }
            if q.front_is(thread) {
                return Ok(core_id);
            }
            core.front_changed.wait(&mut q);
        }
    }

    /// Take `thread` off whatever core it is queued on and give it `status`.
    /// Returns `false` if it had already terminated.
    fn leave_core(&self, thread: &GuestThread, status: ThreadStatus) -> bool {
        loop {
            let core_id = {
                let mut s = thread.sched.lock();
                if s.status == ThreadStatus::Terminated {
                    return false;
                }
                match s.core {
                    None => {
                        s.status = status;
                        return true;
                    }
                    Some(core) => core,
                }
            };
            let core = self.core(core_id);
            let mut q = core.queue.lock();
            {
                let mut s = thread.sched.lock();
                if s.status == ThreadStatus::Terminated {
                    return false;
                }
                if s.core != Some(core_id) {
                    continue;
                }
                s.core = None;
                s.status = status;
            }
            let Some(pos) = q.position(thread.id()) else {
                crate::invariant_violation!("{} missing from {}", thread.id(), core_id);
            };
            q.threads.remove(pos);
            if pos == 0 {
                self.promote_front(core, &mut q, Some(thread.id()));
            } else {
                core.front_changed.notify_all();
            }
            return true;
        }
    }

    /// Apply `change` to the thread's scheduling state under its core's lock
    /// and re-sort the run queue if its effective priority moved. Returns
    /// whether it moved.
    fn modify_thread(
        &self,
        thread: &GuestThread,
        mut change: impl FnMut(&mut SchedState),
    ) -> bool {
        loop {
            let core_id = {
                let mut s = thread.sched.lock();
                match s.core {
                    None => {
                        let before = s.effective_priority();
                        change(&mut *s);
                        return before != s.effective_priority();
                    }
                    Some(core) => core,
                }
            };
            let core = self.core(core_id);
            let mut q = core.queue.lock();
            let (before, after) = {
                let mut s = thread.sched.lock();
                if s.core != Some(core_id) {
                    continue;
                }
                let before = s.effective_priority();
                change(&mut *s);
                (before, s.effective_priority())
            };
            if before != after {
                self.reposition(core, &mut q, thread, after);
            }
            return before != after;
        }
    }

    fn reposition(&self, core: &Core, q: &mut CoreQueue, thread: &GuestThread, priority: Priority) {
        let Some(pos) = q.position(thread.id()) else {
            crate::invariant_violation!("{} missing from {}", thread.id(), core.id);
        };
        if pos > 0 {
            if let Some(moved) = q.threads.remove(pos) {
                let at = q.insertion_point(priority, Placement::BackOfBand, 1);
                q.threads.insert(at, moved);
            }
        }
        self.check_preemption(core, q);
    }

    /// Change a thread's base priority.
    pub fn update_priority(&self, thread: &Arc<GuestThread>, priority: Priority) -> KernelResult<()> {
        if priority > LOWEST_PRIORITY {
            return Err(KernelError::InvalidPriority(priority as u32));
        }
        let mut previous = priority;
        self.modify_thread(thread, |s| {
            previous = s.base_priority;
            s.base_priority = priority;
        });
        if previous != priority {
            self.tracer
                .trace_priority(thread.id(), previous, priority, "set priority");
            // A waiter's new priority re-sorts its wait queues and may change
            // what it lends to mutex owners.
            self.propagate_from(thread);
        }
        Ok(())
    }

    /// Change a thread's ideal core and affinity mask, re-homing it if its
    /// current core is no longer permitted.
    ///
    /// A thread running on that core is asked to yield and moves itself at its
    /// next safe point. A runnable thread is moved immediately. A waiting
    /// thread picks a permitted core when it is woken.
    pub fn update_affinity(
        &self,
        thread: &Arc<GuestThread>,
        ideal: Option<CoreId>,
        mask: CoreMask,
    ) -> KernelResult<()> {
        if mask.is_empty() {
            return Err(KernelError::InvalidCombination("empty affinity mask"));
        }
        if !mask.fits(self.core_count()) {
            let bad = mask
                .cores()
                .find(|c| c.index() >= self.core_count())
                .map_or(-1, |c| c.index() as i32);
            return Err(KernelError::InvalidCoreId(bad));
        }
        if let Some(core) = ideal {
            if !mask.contains(core) {
                return Err(KernelError::InvalidCombination(
                    "ideal core outside affinity mask",
                ));
            }
        }
        self.modify_thread(thread, |s| {
            s.ideal_core = ideal;
            s.affinity = mask;
        });

        let Some(current) = thread.current_core() else {
            return Ok(());
        };
        if mask.contains(current) {
            return Ok(());
        }
        if let Some(target) = self.select_core(ideal, mask) {
            self.migrate(thread, current, target, Placement::BackOfBand, false);
        }
        Ok(())
    }

    /// Move `thread` from `from` to `to`.
    ///
    /// A thread that is running on `from` is only moved when it asked for it
    /// itself (`self_initiated`); otherwise it is told to yield and will move
    /// at its next safe point.
    fn migrate(
        &self,
        thread: &Arc<GuestThread>,
        from: CoreId,
        to: CoreId,
        placement: Placement,
        self_initiated: bool,
    ) -> bool {
        if from == to {
            return false;
        }
        let (src_core, dst_core) = (self.core(from), self.core(to));
        let (mut src, mut dst) = if from < to {
            let src = src_core.queue.lock();
            let dst = dst_core.queue.lock();
            (src, dst)
        } else {
            let dst = dst_core.queue.lock();
            let src = src_core.queue.lock();
            (src, dst)
        };

        if thread.sched.lock().core != Some(from) {
            return false;
        }
        let Some(pos) = src.position(thread.id()) else {
            crate::invariant_violation!("{} missing from {}", thread.id(), from);
        };
        if pos == 0 && !self_initiated {
            self.request_preemption(from, thread, "affinity changed");
            return false;
        }

        let priority = {
            let mut s = thread.sched.lock();
            s.core = Some(to);
            s.status = ThreadStatus::Runnable;
            s.effective_priority()
        };
        src.threads.remove(pos);
        if pos == 0 {
            self.promote_front(src_core, &mut src, Some(thread.id()));
        } else {
            src_core.front_changed.notify_all();
        }
        self.insert(dst_core, &mut dst, thread, priority, placement);
        dst_core.front_changed.notify_all();

        self.metrics.record_migration();
        self.tracer.trace_migration(thread.id(), from, to);
        debug!("{} migrated {} -> {}", thread.id(), from, to);
        true
    }

    /// Move the running `thread` behind (or, when preempted, ahead of) its
    /// equal-priority peers, or off its core if the core is no longer
    /// permitted.
    fn rotate(&self, thread: &Arc<GuestThread>, placement: Placement) {
        let Some(core_id) = thread.current_core() else {
            return;
        };
        let core = self.core(core_id);
        let mut q = core.queue.lock();
        if !q.front_is(thread) {
            return;
        }
        let (priority, mask, ideal) = {
            let s = thread.sched.lock();
            (s.effective_priority(), s.affinity, s.ideal_core)
        };

        if !mask.contains(core_id) {
            drop(q);
            if let Some(target) = self.select_core(ideal, mask) {
                self.migrate(thread, core_id, target, placement, true);
            }
            return;
        }

        let Some(current) = q.threads.pop_front() else {
            return;
        };
        let at = q.insertion_point(priority, placement, 0);
        q.threads.insert(at, current);
        if q.front_is(thread) {
            q.slice_start = Instant::now();
        } else {
            thread.sched.lock().status = ThreadStatus::Runnable;
            self.promote_front(core, &mut q, Some(thread.id()));
        }
    }

    fn slice_expired(&self, thread: &GuestThread) -> bool {
        let Some(core_id) = thread.current_core() else {
            return false;
        };
        let q = self.core(core_id).queue.lock();
        if !q.front_is(thread) || q.slice_start.elapsed() < self.time_slice {
            return false;
        }
        q.threads
            .get(1)
            .is_some_and(|next| next.effective_priority() <= thread.effective_priority())
    }

    /// The scheduler's half of the safe-point contract.
    ///
    /// Honors a pending preemption or an expired time slice, then parks until
    /// the thread is dispatched again. Returns `TerminationRequested` if the
    /// thread must exit instead; the caller is responsible for retiring it.
    pub fn safe_point(&self, thread: &Arc<GuestThread>) -> KernelResult<()> {
        if thread.termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        if thread.pending_yield.swap(false, Ordering::AcqRel) {
            self.rotate(thread, Placement::FrontOfBand);
        } else if self.slice_expired(thread) {
            self.metrics.record_time_slice_rotation();
            self.rotate(thread, Placement::BackOfBand);
        }
        self.wait_schedule(thread).map(drop)
    }

    /// Cooperative yield: behind every runnable thread of equal priority.
    /// Never lowers the thread's priority and does nothing when it has no
    /// equal-priority peer.
    pub fn yield_thread(&self, thread: &Arc<GuestThread>) -> KernelResult<()> {
        if thread.termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        self.metrics.record_yield();
        self.rotate(thread, Placement::BackOfBand);
        self.wait_schedule(thread).map(drop)
    }

    /// Yield, moving to an idle permitted core when the current one has other
    /// work queued.
    pub fn yield_with_migration(&self, thread: &Arc<GuestThread>) -> KernelResult<()> {
        if thread.termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        let (current, mask) = {
            let s = thread.sched.lock();
            (s.core, s.affinity)
        };
        if let Some(from) = current {
            let busy = self.core(from).queue.lock().threads.len() > 1;
            let idle = mask
                .cores()
                .take_while(|c| c.index() < self.core_count())
                .filter(|&c| c != from)
                .find(|&c| self.core(c).queue.lock().threads.is_empty());
            if let (true, Some(to)) = (busy, idle) {
                self.metrics.record_yield();
                if self.migrate(thread, from, to, Placement::BackOfBand, true) {
                    return self.wait_schedule(thread).map(drop);
                }
            }
        }
        self.yield_thread(thread)
    }

    /// Ask `thread` to terminate. Threads that are not running are retired at
    /// once and `true` is returned. A running thread is interrupted and
    /// retires itself at its next safe point.
    pub fn request_termination(&self, thread: &Arc<GuestThread>) -> bool {
        thread.terminate_requested.store(true, Ordering::Release);
        if let Some(core_id) = thread.current_core() {
            let q = self.core(core_id).queue.lock();
            if q.front_is(thread) {
                self.request_preemption(core_id, thread, "termination");
                return false;
            }
        }
        self.remove_thread(thread)
    }

    /// Per-core view, copied under each core lock in turn.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            time_slice_us: self.time_slice.as_micros() as u64,
            cores: self
                .cores
                .iter()
                .map(|core| {
                    let q = core.queue.lock();
                    CoreSnapshot {
                        core: core.id,
                        running: q.front().map(|t| t.id()),
                        runnable: q.runnable_ids(),
                    }
                })
                .collect(),
        }
    }
}
