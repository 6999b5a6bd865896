use crate::utils::sync::{Arc, Condvar, Mutex};
use std::{collections::VecDeque, time::Instant};

use crate::kernel::types::{CoreId, GuestThread, Priority, ThreadId};

/// Where a thread lands among threads of its own priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Ahead of its peers: a preempted thread resumes before them
    FrontOfBand,
    /// Behind its peers: newly runnable, yielded, or out of time slice
    BackOfBand,
}

/// One virtual core's run queue.
///
/// Index 0 is the running thread. The rest are runnable and kept sorted by
/// effective priority, FIFO within a priority. The running thread is never
/// displaced by an insertion; a more urgent arrival asks it to yield instead.
#[derive(Debug)]
pub(crate) struct CoreQueue {
    pub threads: VecDeque<Arc<GuestThread>>,
    pub slice_start: Instant,
}

impl CoreQueue {
    pub fn front(&self) -> Option<&Arc<GuestThread>> {
        self.threads.front()
    }

    pub fn front_is(&self, thread: &GuestThread) -> bool {
        self.front().is_some_and(|f| f.id() == thread.id())
    }

    pub fn position(&self, thread: ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.id() == thread)
    }

    /// Insertion index for `priority`, searching from `start`.
    ///
    /// Takes each queued thread's lock in turn; the caller must not hold any
    /// thread lock.
    pub fn insertion_point(&self, priority: Priority, placement: Placement, start: usize) -> usize {
        let start = start.min(self.threads.len());
        let offset = self.threads.range(start..).position(|t| {
            let other = t.effective_priority();
            match placement {
                Placement::FrontOfBand => other >= priority,
                Placement::BackOfBand => other > priority,
            }
        });
        offset.map_or(self.threads.len(), |o| start + o)
    }

    pub fn runnable_ids(&self) -> Vec<ThreadId> {
        self.threads.iter().skip(1).map(|t| t.id()).collect()
    }
}

#[derive(Debug)]
pub(crate) struct Core {
    pub id: CoreId,
    pub queue: Mutex<CoreQueue>,
    /// Notified whenever the front of `queue` changes
    pub front_changed: Condvar,
}

impl Core {
    pub fn new(id: CoreId) -> Self {
        Self {
            id,
            queue: Mutex::new(CoreQueue {
                threads: VecDeque::new(),
                slice_start: Instant::now(),
            }),
            front_changed: Condvar::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::ContextHandle;
    use crate::kernel::types::{thread::ThreadParams, CoreMask};
    use crate::utils::sync::Weak;

    fn thread(id: u64, priority: Priority) -> Arc<GuestThread> {
        Arc::new(GuestThread::new(ThreadParams {
            id: ThreadId(id),
            process: Weak::new(),
            context: ContextHandle(id),
            entry: 0,
            argument: 0,
            stack_top: 0,
            priority,
            ideal_core: None,
            affinity: CoreMask(1),
        }))
    }

    #[test]
    fn test_insertion_point_respects_bands() {
        let core = Core::new(CoreId(0));
        let mut q = core.queue.lock();
        q.threads.extend([thread(1, 30), thread(2, 10), thread(3, 10), thread(4, 20)]);

        assert_eq!(q.insertion_point(10, Placement::BackOfBand, 1), 3);
        assert_eq!(q.insertion_point(10, Placement::FrontOfBand, 1), 1);
        assert_eq!(q.insertion_point(40, Placement::BackOfBand, 1), 4);
        assert_eq!(q.insertion_point(0, Placement::BackOfBand, 1), 1);
        assert_eq!(q.runnable_ids(), vec![ThreadId(2), ThreadId(3), ThreadId(4)]);
        assert!(q.front_is(&thread(1, 0)));
    }
}
