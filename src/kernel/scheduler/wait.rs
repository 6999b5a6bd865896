//! Blocking, waking and thread retirement.
//!
//! A wait is entered with every target object locked (ascending id), so
//! checking the objects, joining their queues and leaving the core is a
//! single step from any waker's point of view. Release is decided through the
//! waiting thread's wait slot: the first party to store a result owns it.
use crate::kernel::{
    error::{KernelError, KernelResult, WaitOutcome},
    types::{
        sync_object::ObjectInner,
        thread::WaitWake,
        GuestThread, ObjectId, ObjectKind, Priority, SyncObject, SyncState, ThreadStatus,
        Waitable,
    },
};
use crate::utils::sync::{Arc, MutexGuard, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{Placement, Scheduler};

fn unique_by_id(objects: &[Arc<SyncObject>]) -> Vec<Arc<SyncObject>> {
    let mut unique = objects.to_vec();
    unique.sort_by_key(|o| o.id());
    unique.dedup_by_key(|o| o.id());
    unique
}

impl Scheduler {
    /// Block `thread` on a single object. See [`Scheduler::wait_any`].
    pub fn yield_and_wait_for(
        &self,
        thread: &Arc<GuestThread>,
        object: &Arc<SyncObject>,
        timeout: Option<Duration>,
    ) -> KernelResult<WaitOutcome> {
        self.wait_any(thread, std::slice::from_ref(object), timeout)
    }

    /// Wait until one of `objects` is signaled, the timeout passes, the wait
    /// is cancelled, or the thread is terminated.
    ///
    /// A signaled object is consumed immediately without blocking, the first
    /// one in `objects` order winning. `Some(Duration::ZERO)` polls; `None`
    /// waits forever. Waiting on a mutex the thread already owns fails with
    /// `ReentrantLock`.
    pub fn wait_any(
        &self,
        thread: &Arc<GuestThread>,
        objects: &[Arc<SyncObject>],
        timeout: Option<Duration>,
    ) -> KernelResult<WaitOutcome> {
        if objects.len() > self.max_wait_objects {
            return Err(KernelError::OutOfRange("too many objects in one wait"));
        }
        if thread.termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        if thread.cancel_pending.swap(false, Ordering::AcqRel) {
            self.metrics.record_wait_cancellation();
            return Err(KernelError::Cancelled);
        }

        let started = Instant::now();
        let unique = unique_by_id(objects);
        let mut guards: Vec<MutexGuard<'_, ObjectInner>> =
            unique.iter().map(|o| o.lock()).collect();
        let guard_index = |id: ObjectId| unique.iter().position(|o| o.id() == id).unwrap_or(0);

        for inner in &guards {
            if let SyncState::MutexState(m) = &inner.state {
                if m.is_owned_by(thread) {
                    return Err(KernelError::ReentrantLock);
                }
            }
        }

        for (index, object) in objects.iter().enumerate() {
            let inner = &mut *guards[guard_index(object.id())];
            if inner.state.is_signaled() {
                self.hand_over(object, inner, thread);
                trace!("{} acquired {} without blocking", thread.id(), object.id());
                return Ok(WaitOutcome::Signaled { index });
            }
        }

        if timeout == Some(Duration::ZERO) {
            return Ok(WaitOutcome::TimedOut);
        }

        let priority = thread.effective_priority();
        let mut boosted = Vec::new();
        let entered = {
            let mut slot = thread.wait.lock();
            slot.begin(objects.to_vec(), false);
            for (object, inner) in unique.iter().zip(guards.iter_mut()) {
                inner.waiters.push(thread.clone(), priority);
                if let SyncState::MutexState(m) = &inner.state {
                    if let Some(owner) = m.owner() {
                        let best = inner.waiters.best_priority();
                        if self.apply_boost(owner, object.id(), best) {
                            boosted.push(owner.clone());
                        }
                    }
                }
            }
            self.leave_core(thread, ThreadStatus::Waiting)
        };
        drop(guards);

        if !entered {
            self.detach(thread, &unique);
            thread.wait.lock().finish();
            return Err(KernelError::TerminationRequested);
        }

        self.metrics.record_wait();
        self.tracer.trace_wait(thread.id(), objects.len(), timeout);
        for owner in &boosted {
            self.propagate_from(owner);
        }

        let wake = self.park(thread, timeout.map(|t| started + t));
        self.detach(thread, &unique);
        thread.wait.lock().finish();

        match wake {
            WaitWake::Signaled(index) => {
                if objects[index].kind() == ObjectKind::Mutex {
                    self.metrics.record_lock_contention(started.elapsed());
                }
                self.wait_schedule(thread)?;
                Ok(WaitOutcome::Signaled { index })
            }
            WaitWake::TimedOut => {
                self.metrics.record_wait_timeout();
                self.tracer.trace_wake(thread.id(), "timed out");
                self.wait_schedule(thread)?;
                Ok(WaitOutcome::TimedOut)
            }
            WaitWake::Cancelled => {
                self.wait_schedule(thread)?;
                Err(KernelError::Cancelled)
            }
            WaitWake::Terminated => Err(KernelError::TerminationRequested),
        }
    }

    /// Give a signaled object to `thread`, which is not queued on it.
    fn hand_over(&self, object: &Arc<SyncObject>, inner: &mut ObjectInner, thread: &Arc<GuestThread>) {
        inner.state.consume(thread);
        if let SyncState::MutexState(_) = inner.state {
            thread.add_held(object);
            let best = inner.waiters.best_priority();
            self.apply_boost(thread, object.id(), best);
        }
    }

    /// Park until the wait slot is claimed. On deadline the thread claims it
    /// itself and becomes runnable again.
    ///
    /// A termination request that raced with entering the wait is claimed
    /// here: the requester saw the thread still running and only interrupted it.
    fn park(&self, thread: &Arc<GuestThread>, deadline: Option<Instant>) -> WaitWake {
        let mut slot = thread.wait.lock();
        loop {
            if let Some(wake) = slot.result {
                return wake;
            }
            if thread.termination_requested() && slot.claim(WaitWake::Terminated) {
                return WaitWake::Terminated;
            }
            match deadline {
                None => thread.wait_cv.wait(&mut slot),
                Some(deadline) if Instant::now() >= deadline => {
                    if slot.claim(WaitWake::TimedOut) {
                        self.make_runnable(thread);
                    }
                }
                Some(deadline) => {
                    thread.wait_cv.wait_until(&mut slot, deadline);
                }
            }
        }
    }

    /// Queue a released waiter on its preferred permitted core. The caller
    /// holds the waiter's wait slot and has just claimed it.
    fn make_runnable(&self, thread: &Arc<GuestThread>) {
        let (ideal, mask) = {
            let s = thread.sched.lock();
            (s.ideal_core, s.affinity)
        };
        let Some(core) = self.select_core(ideal, mask) else {
            crate::invariant_violation!("{} has no permitted core (mask {})", thread.id(), mask);
        };
        self.enqueue(thread, core, Placement::BackOfBand, ThreadStatus::Waiting);
    }

    /// Remove `thread`'s entries from `objects` and recompute what it was
    /// lending to mutex owners.
    fn detach(&self, thread: &GuestThread, objects: &[Arc<SyncObject>]) {
        for object in objects {
            let mut inner = object.lock();
            if !inner.waiters.remove(thread.id()) {
                continue;
            }
            let owner = match &inner.state {
                SyncState::MutexState(m) => m.owner().cloned(),
                _ => None,
            };
            if let Some(owner) = owner {
                let best = inner.waiters.best_priority();
                let changed = self.apply_boost(&owner, object.id(), best);
                drop(inner);
                if changed {
                    self.propagate_from(&owner);
                }
            }
        }
    }

    /// Set the priority `object` lends to `thread`. Returns whether the
    /// thread's effective priority moved.
    fn apply_boost(&self, thread: &GuestThread, object: ObjectId, boost: Option<Priority>) -> bool {
        let (mut before, mut after) = (0, 0);
        let changed = self.modify_thread(thread, |s| {
            before = s.effective_priority();
            s.set_boost(object, boost);
            after = s.effective_priority();
        });
        if changed {
            if after < before {
                self.metrics.record_priority_boost();
            }
            self.tracer
                .trace_priority(thread.id(), before, after, "inheritance");
        }
        changed
    }

    /// Re-sort a waiting thread in its wait queues after its priority moved,
    /// and pass the change along the chain of mutex owners it waits on.
    pub(crate) fn propagate_from(&self, start: &Arc<GuestThread>) {
        let mut pending = vec![(start.clone(), 0usize)];
        while let Some((thread, depth)) = pending.pop() {
            if depth >= self.inheritance_depth_limit {
                debug!(
                    "priority inheritance from {} stopped at depth {}",
                    start.id(),
                    depth
                );
                continue;
            }
            let targets = {
                let slot = thread.wait.lock();
                if !slot.is_claimable() {
                    continue;
                }
                unique_by_id(&slot.targets)
            };
            let priority = thread.effective_priority();
            for object in targets {
                let mut inner = object.lock();
                inner.waiters.reposition(thread.id(), priority);
                let owner = match &inner.state {
                    SyncState::MutexState(m) => m.owner().cloned(),
                    _ => None,
                };
                if let Some(owner) = owner {
                    let best = inner.waiters.best_priority();
                    if self.apply_boost(&owner, object.id(), best) {
                        pending.push((owner, depth + 1));
                    }
                }
            }
        }
    }

    /// Release up to `max` waiters of a locked object while it stays signaled,
    /// most urgent first. Stale entries of already-released multi-waiters are
    /// dropped.
    fn wake_waiters(&self, object: &Arc<SyncObject>, inner: &mut ObjectInner, max: usize) -> usize {
        let mut woken = 0;
        while woken < max && inner.state.is_signaled() {
            let Some(entry) = inner.waiters.pop_front() else {
                break;
            };
            let waiter = entry.thread;
            let mut slot = waiter.wait.lock();
            if !slot.is_claimable() {
                continue;
            }
            let Some(index) = slot.targets.iter().position(|t| t.id() == object.id()) else {
                crate::invariant_violation!(
                    "{} queued on {} without waiting for it",
                    waiter.id(),
                    object.id()
                );
            };
            slot.result = Some(WaitWake::Signaled(index));
            self.hand_over(object, inner, &waiter);
            self.make_runnable(&waiter);
            waiter.wait_cv.notify_one();
            drop(slot);

            self.metrics.record_wakeup();
            self.tracer.trace_wake(waiter.id(), "signaled");
            woken += 1;
        }
        woken
    }

    /// Release the most urgent waiter if `object` is signaled.
    pub fn wake_one(&self, object: &Arc<SyncObject>) -> usize {
        let mut inner = object.lock();
        self.wake_waiters(object, &mut inner, 1)
    }

    /// Release waiters for as long as `object` stays signaled.
    pub fn wake_all(&self, object: &Arc<SyncObject>) -> usize {
        let mut inner = object.lock();
        self.wake_waiters(object, &mut inner, usize::MAX)
    }

    /// Mutex acquire: take ownership now if free, otherwise block (lending
    /// priority to the owner) until handed ownership.
    pub fn acquire_mutex(
        &self,
        thread: &Arc<GuestThread>,
        mutex: &Arc<SyncObject>,
        timeout: Option<Duration>,
    ) -> KernelResult<WaitOutcome> {
        if mutex.kind() != ObjectKind::Mutex {
            return Err(KernelError::InvalidState("object is not a mutex"));
        }
        self.yield_and_wait_for(thread, mutex, timeout)
    }

    /// Mutex release: hand ownership straight to the most urgent waiter, if
    /// any, and drop what the waiters were lending the releasing thread.
    pub fn release_mutex(&self, thread: &Arc<GuestThread>, mutex: &Arc<SyncObject>) -> KernelResult<()> {
        let mut inner = mutex.lock();
        let SyncState::MutexState(m) = &mut inner.state else {
            return Err(KernelError::InvalidState("object is not a mutex"));
        };
        if !m.is_owned_by(thread) {
            return Err(KernelError::NotOwner);
        }
        m.clear_owner();
        thread.remove_held(mutex.id());
        self.apply_boost(thread, mutex.id(), None);
        self.wake_waiters(mutex, &mut inner, 1);
        Ok(())
    }

    /// Release every mutex `thread` still owns, handing each to its next
    /// waiter.
    fn release_all(&self, thread: &GuestThread) {
        for mutex in thread.take_held() {
            let mut inner = mutex.lock();
            let released = match &mut inner.state {
                SyncState::MutexState(m) if m.is_owned_by(thread) => m.clear_owner().is_some(),
                _ => false,
            };
            if released {
                self.wake_waiters(&mutex, &mut inner, 1);
            }
        }
    }

    /// Add `count` to a semaphore and wake up to `count` waiters.
    pub fn signal_semaphore(&self, semaphore: &Arc<SyncObject>, count: u32) -> KernelResult<usize> {
        let mut inner = semaphore.lock();
        let SyncState::SemaphoreState(s) = &mut inner.state else {
            return Err(KernelError::InvalidState("object is not a semaphore"));
        };
        if !s.release(count) {
            return Err(KernelError::LimitReached("semaphore count above its maximum"));
        }
        Ok(self.wake_waiters(semaphore, &mut inner, count as usize))
    }

    /// Set an event. An auto-reset event releases one waiter, a manual-reset
    /// event all of them.
    pub fn signal_event(&self, event: &Arc<SyncObject>) -> KernelResult<usize> {
        let mut inner = event.lock();
        let SyncState::EventState(e) = &mut inner.state else {
            return Err(KernelError::InvalidState("object is not an event"));
        };
        e.set();
        Ok(self.wake_waiters(event, &mut inner, usize::MAX))
    }

    /// Reset an event. Returns whether it was signaled.
    pub fn clear_event(&self, event: &Arc<SyncObject>) -> KernelResult<bool> {
        let mut inner = event.lock();
        match &mut inner.state {
            SyncState::EventState(e) => Ok(e.clear()),
            _ => Err(KernelError::InvalidState("object is not an event")),
        }
    }

    /// Fire a process exit signal, releasing every waiter. Returns `false` if
    /// it had already fired.
    pub fn fire_exit_signal(&self, signal: &Arc<SyncObject>) -> bool {
        let mut inner = signal.lock();
        let fired = match &mut inner.state {
            SyncState::ExitSignalState(s) => s.fire(),
            _ => false,
        };
        if fired {
            self.wake_waiters(signal, &mut inner, usize::MAX);
        }
        fired
    }

    /// Cancel `thread`'s object wait, which then fails with `Cancelled`. A
    /// thread that is not in an object wait has its next one cancelled
    /// instead.
    pub fn cancel_wait(&self, thread: &Arc<GuestThread>) -> bool {
        let mut slot = thread.wait.lock();
        if !slot.sleeping && slot.claim(WaitWake::Cancelled) {
            self.make_runnable(thread);
            thread.wait_cv.notify_one();
            drop(slot);
            self.metrics.record_wait_cancellation();
            self.tracer.trace_wake(thread.id(), "cancelled");
            true
        } else {
            thread.cancel_pending.store(true, Ordering::Release);
            false
        }
    }

    /// Leave the core for `duration`. Zero is a plain yield.
    pub fn sleep(&self, thread: &Arc<GuestThread>, duration: Duration) -> KernelResult<()> {
        if duration.is_zero() {
            return self.yield_thread(thread);
        }
        if thread.termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        let deadline = Instant::now() + duration;
        let entered = {
            let mut slot = thread.wait.lock();
            slot.begin(Vec::new(), true);
            self.leave_core(thread, ThreadStatus::Waiting)
        };
        if !entered {
            thread.wait.lock().finish();
            return Err(KernelError::TerminationRequested);
        }
        self.tracer.trace_wait(thread.id(), 0, Some(duration));

        let wake = self.park(thread, Some(deadline));
        thread.wait.lock().finish();
        match wake {
            WaitWake::Terminated => Err(KernelError::TerminationRequested),
            _ => self.wait_schedule(thread).map(drop),
        }
    }

    /// Retire `thread`: take it off its core or out of its wait, mark it
    /// terminated, then release the mutexes it owns. Queue removal happens
    /// before any hand-off so no waiter ever sees a dying owner.
    ///
    /// Returns `false` if the thread had already been retired.
    pub fn remove_thread(&self, thread: &Arc<GuestThread>) -> bool {
        thread.terminate_requested.store(true, Ordering::Release);
        let (targets, retired) = {
            let mut slot = thread.wait.lock();
            let targets = if slot.claim(WaitWake::Terminated) {
                thread.wait_cv.notify_all();
                unique_by_id(&slot.targets)
            } else {
                Vec::new()
            };
            (targets, self.leave_core(thread, ThreadStatus::Terminated))
        };
        if !retired {
            return false;
        }
        self.detach(thread, &targets);
        self.release_all(thread);
        self.tracer.trace_thread_exit(thread.id());
        debug!("{} retired", thread.id());
        true
    }
}
