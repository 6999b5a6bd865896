//! Waitable kernel objects.
//!
//! The set of kinds is fixed by the guest kernel, so it is a closed enum
//! dispatched through [`Waitable`]. Every object carries its own lock and wait
//! queue; all state changes and wake decisions happen under that lock.
use crate::utils::sync::{Arc, Mutex, MutexGuard};
use enum_dispatch::enum_dispatch;
use serde::Serialize;
use std::collections::VecDeque;

use super::{GuestThread, ObjectId, Priority, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectKind {
    Mutex,
    Semaphore,
    Event,
    ProcessExit,
}

#[enum_dispatch]
pub trait Waitable {
    fn kind(&self) -> ObjectKind;

    /// Whether a waiter arriving now would be satisfied without blocking.
    fn is_signaled(&self) -> bool;

    /// Hand the signal to `thread`. Only called when `is_signaled()` holds.
    fn consume(&mut self, thread: &Arc<GuestThread>);
}

#[derive(Debug, Default)]
pub struct MutexState {
    owner: Option<Arc<GuestThread>>,
}

impl MutexState {
    pub fn owner(&self) -> Option<&Arc<GuestThread>> {
        self.owner.as_ref()
    }

    pub fn is_owned_by(&self, thread: &GuestThread) -> bool {
        self.owner.as_ref().is_some_and(|o| o.id() == thread.id())
    }

    pub(crate) fn clear_owner(&mut self) -> Option<Arc<GuestThread>> {
        self.owner.take()
    }
}

impl Waitable for MutexState {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Mutex
    }

    fn is_signaled(&self) -> bool {
        self.owner.is_none()
    }

    fn consume(&mut self, thread: &Arc<GuestThread>) {
        self.owner = Some(thread.clone());
    }
}

/// Counting semaphore. `count` never goes below zero.
#[derive(Debug)]
pub struct SemaphoreState {
    count: u32,
    max: u32,
}

impl SemaphoreState {
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            count: initial,
            max,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Add `n` to the count. Fails without side effects if that would pass `max`.
    pub(crate) fn release(&mut self, n: u32) -> bool {
        match self.count.checked_add(n) {
            Some(count) if count <= self.max => {
                self.count = count;
                true
            }
            _ => false,
        }
    }
}

impl Waitable for SemaphoreState {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Semaphore
    }

    fn is_signaled(&self) -> bool {
        self.count > 0
    }

    fn consume(&mut self, _thread: &Arc<GuestThread>) {
        self.count -= 1;
    }
}

#[derive(Debug)]
pub struct EventState {
    signaled: bool,
    auto_reset: bool,
}

impl EventState {
    pub fn new(auto_reset: bool) -> Self {
        Self {
            signaled: false,
            auto_reset,
        }
    }

    pub fn auto_reset(&self) -> bool {
        self.auto_reset
    }

    pub(crate) fn set(&mut self) {
        self.signaled = true;
    }

    /// Returns whether the event was signaled.
    pub(crate) fn clear(&mut self) -> bool {
        std::mem::replace(&mut self.signaled, false)
    }
}

impl Waitable for EventState {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Event
    }

    fn is_signaled(&self) -> bool {
        self.signaled
    }

    fn consume(&mut self, _thread: &Arc<GuestThread>) {
        if self.auto_reset {
            self.signaled = false;
        }
    }
}

/// Fires once when its process has no live threads left. Never resets.
#[derive(Debug, Default)]
pub struct ExitSignalState {
    fired: bool,
}

impl ExitSignalState {
    /// Returns `false` if the signal had already fired.
    pub(crate) fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }
}

impl Waitable for ExitSignalState {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ProcessExit
    }

    fn is_signaled(&self) -> bool {
        self.fired
    }

    fn consume(&mut self, _thread: &Arc<GuestThread>) {}
}

#[enum_dispatch(Waitable)]
#[derive(Debug)]
pub enum SyncState {
    MutexState,
    SemaphoreState,
    EventState,
    ExitSignalState,
}

#[derive(Debug)]
pub(crate) struct WaitEntry {
    pub priority: Priority,
    pub arrival: u64,
    pub thread: Arc<GuestThread>,
}

/// Waiters ordered by priority, then arrival.
///
/// A thread waiting on several objects sits in each of their queues. Once one
/// object releases it, its entries elsewhere are stale until the thread
/// removes them; wakers skip them.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<WaitEntry>,
    next_arrival: u64,
}

impl WaitQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, thread: Arc<GuestThread>, priority: Priority) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.insert(WaitEntry {
            priority,
            arrival,
            thread,
        });
    }

    fn insert(&mut self, entry: WaitEntry) {
        let key = (entry.priority, entry.arrival);
        let at = self
            .entries
            .partition_point(|e| (e.priority, e.arrival) < key);
        self.entries.insert(at, entry);
    }

    pub fn pop_front(&mut self) -> Option<WaitEntry> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, thread: ThreadId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.thread.id() != thread);
        before != self.entries.len()
    }

    /// Re-sort `thread` after a priority change, keeping its arrival rank.
    pub fn reposition(&mut self, thread: ThreadId, priority: Priority) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.thread.id() == thread) else {
            return false;
        };
        if self.entries[pos].priority == priority {
            return false;
        }
        if let Some(mut entry) = self.entries.remove(pos) {
            entry.priority = priority;
            self.insert(entry);
        }
        true
    }

    /// Most urgent priority among queued waiters.
    pub fn best_priority(&self) -> Option<Priority> {
        self.entries.front().map(|e| e.priority)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.entries.iter().map(|e| e.thread.id()).collect()
    }
}

#[derive(Debug)]
pub(crate) struct ObjectInner {
    pub state: SyncState,
    pub waiters: WaitQueue,
}

/// A guest-visible waitable kernel object.
///
/// Shared by every handle and wait queue that references it; freed when the
/// last of those goes away.
#[derive(Debug)]
pub struct SyncObject {
    id: ObjectId,
    inner: Mutex<ObjectInner>,
}

impl SyncObject {
    pub(crate) fn new(id: ObjectId, state: impl Into<SyncState>) -> Self {
        Self {
            id,
            inner: Mutex::new(ObjectInner {
                state: state.into(),
                waiters: WaitQueue::default(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.inner.lock().state.kind()
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.lock().state.is_signaled()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn waiter_ids(&self) -> Vec<ThreadId> {
        self.inner.lock().waiters.thread_ids()
    }

    /// Current owner, for mutexes.
    pub fn owner(&self) -> Option<ThreadId> {
        match &self.inner.lock().state {
            SyncState::MutexState(m) => m.owner().map(|o| o.id()),
            _ => None,
        }
    }

    /// Current count, for semaphores.
    pub fn count(&self) -> Option<u32> {
        match &self.inner.lock().state {
            SyncState::SemaphoreState(s) => Some(s.count()),
            _ => None,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ObjectInner> {
        self.inner.lock()
    }
}
