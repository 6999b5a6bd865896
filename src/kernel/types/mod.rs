//! Guest kernel object model: identifiers, threads, processes and waitable
//! synchronization objects.
use serde::Serialize;
use std::fmt;

use super::error::{KernelError, KernelResult};

pub mod process;
pub mod sync_object;
pub mod thread;

pub use process::{GuestProcess, ProcessState};
pub use sync_object::{
    EventState, ExitSignalState, MutexState, ObjectKind, SemaphoreState, SyncObject, SyncState,
    Waitable,
};
pub use thread::{GuestThread, ThreadStatus};

/// Guest scheduling priority. Lower values are more urgent.
pub type Priority = u8;

pub const HIGHEST_PRIORITY: Priority = 0;
pub const LOWEST_PRIORITY: Priority = 63;

pub fn validate_priority(raw: u32) -> KernelResult<Priority> {
    if raw > LOWEST_PRIORITY as u32 {
        return Err(KernelError::InvalidPriority(raw));
    }
    Ok(raw as Priority)
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($repr:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Session-unique guest thread id, as reported by `GetThreadId`.
    ThreadId(u64),
    "T"
);
id_type!(ProcessId(u64), "P");
id_type!(
    /// Session-unique id of a waitable object. Multi-object locking is done in
    /// ascending `ObjectId` order.
    ObjectId(u64),
    "O"
);
id_type!(CoreId(usize), "core");

impl CoreId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Opaque per-process integer naming a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// Resolves to the calling thread's process without a table entry.
    pub const CURRENT_PROCESS: Handle = Handle(0xFFFF_8000);
    /// Resolves to the calling thread without a table entry.
    pub const CURRENT_THREAD: Handle = Handle(0xFFFF_8001);

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Set of cores a thread may run on, one bit per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct CoreMask(pub u64);

impl CoreMask {
    pub const EMPTY: CoreMask = CoreMask(0);

    pub fn single(core: CoreId) -> Self {
        CoreMask(1 << core.index())
    }

    pub fn all(core_count: usize) -> Self {
        if core_count >= 64 {
            CoreMask(u64::MAX)
        } else {
            CoreMask((1 << core_count) - 1)
        }
    }

    pub fn contains(self, core: CoreId) -> bool {
        core.index() < 64 && self.0 & (1 << core.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every core in the mask exists on a machine with `core_count` cores.
    pub fn fits(self, core_count: usize) -> bool {
        self.0 & !Self::all(core_count).0 == 0
    }

    pub fn cores(self) -> impl Iterator<Item = CoreId> {
        (0..64usize)
            .filter(move |&i| self.0 & (1u64 << i) != 0)
            .map(CoreId)
    }

    pub fn lowest(self) -> Option<CoreId> {
        if self.is_empty() {
            None
        } else {
            Some(CoreId(self.0.trailing_zeros() as usize))
        }
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_mask_membership() {
        let mask = CoreMask(0b1010);
        assert!(mask.contains(CoreId(1)));
        assert!(!mask.contains(CoreId(0)));
        assert_eq!(mask.lowest(), Some(CoreId(1)));
        assert_eq!(mask.cores().collect::<Vec<_>>(), vec![CoreId(1), CoreId(3)]);
        assert!(mask.fits(4));
        assert!(!mask.fits(3));
        assert_eq!(CoreMask::all(64).0, u64::MAX);
        assert_eq!(CoreMask::EMPTY.lowest(), None);
    }

    #[test]
    fn test_priority_range() {
        assert_eq!(validate_priority(0), Ok(HIGHEST_PRIORITY));
        assert_eq!(validate_priority(63), Ok(LOWEST_PRIORITY));
        assert_eq!(validate_priority(64), Err(KernelError::InvalidPriority(64)));
    }

    #[test]
    fn test_ids_display_with_prefix() {
        assert_eq!(ThreadId(7).to_string(), "T7");
        assert_eq!(CoreId(2).to_string(), "core2");
        assert_eq!(Handle::CURRENT_THREAD.to_string(), "0xFFFF8001");
    }
}
