//! Basic synchronization primitives.
//!
//! Every kernel module pulls its locks from here so the whole crate agrees on a
//! single implementation (`parking_lot`, whose `Condvar::wait_until` gives the
//! deadline semantics guest timeouts need). Low-level modules can depend on this
//! without pulling in the scheduler.
use std::cell::Cell;

pub use parking_lot::{Condvar, Mutex, MutexGuard};
pub use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

thread_local! {
    /// Raw id of the guest thread this host thread is currently executing.
    static CURRENT_GUEST_THREAD: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Bind the calling host thread to a guest thread id (or clear the binding).
pub fn set_current_guest_thread(id: Option<u64>) {
    CURRENT_GUEST_THREAD.with(|current| current.set(id));
}

/// Raw id of the guest thread bound to the calling host thread, if any.
pub fn current_guest_thread() -> Option<u64> {
    CURRENT_GUEST_THREAD.with(|current| current.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_guest_binding_is_per_host_thread() {
        set_current_guest_thread(Some(7));
        let other = thread::spawn(current_guest_thread).join().unwrap();
        assert_eq!(other, None);
        assert_eq!(current_guest_thread(), Some(7));
        set_current_guest_thread(None);
        assert_eq!(current_guest_thread(), None);
    }
}
