//! The slice of the memory manager the kernel needs.
//!
//! Guest address spaces live elsewhere. The scheduler only asks for an opaque
//! execution context per thread, and the supervisor-call layer reads handle
//! arrays out of guest memory.
use crate::utils::sync::{AtomicU64, Ordering};
use dashmap::DashMap;
use serde::Serialize;

use super::{
    error::{KernelError, KernelResult},
    types::{Handle, ThreadId},
};

/// Opaque per-thread register/stack context, saved and restored by the
/// execution engine at safe points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContextHandle(pub u64);

pub trait MemoryManager: Send + Sync {
    fn create_context(&self, thread: ThreadId, stack_top: u64) -> KernelResult<ContextHandle>;

    fn release_context(&self, context: ContextHandle);

    /// Read `count` 32-bit handles starting at guest address `address`.
    fn read_handles(&self, address: u64, count: usize) -> KernelResult<Vec<Handle>>;

    /// Store a handle array at guest address `address`.
    fn write_handles(&self, address: u64, handles: &[Handle]) -> KernelResult<()>;
}

/// In-process memory manager: contexts are counters, and handle arrays are
/// staged by the host before the guest passes their address to a call.
#[derive(Debug, Default)]
pub struct HostMemory {
    next_context: AtomicU64,
    contexts: DashMap<ContextHandle, ThreadId>,
    handle_arrays: DashMap<u64, Vec<Handle>>,
    next_array: AtomicU64,
}

impl HostMemory {
    const ARRAY_BASE: u64 = 0x1000_0000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Place `handles` in guest memory and return their address.
    pub fn stage_handles(&self, handles: &[Handle]) -> u64 {
        let address =
            Self::ARRAY_BASE + self.next_array.fetch_add(1, Ordering::Relaxed) * 0x1000;
        self.handle_arrays.insert(address, handles.to_vec());
        address
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }
}

impl MemoryManager for HostMemory {
    fn create_context(&self, thread: ThreadId, _stack_top: u64) -> KernelResult<ContextHandle> {
        let context = ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed) + 1);
        self.contexts.insert(context, thread);
        Ok(context)
    }

    fn release_context(&self, context: ContextHandle) {
        self.contexts.remove(&context);
    }

    fn read_handles(&self, address: u64, count: usize) -> KernelResult<Vec<Handle>> {
        let array = self
            .handle_arrays
            .get(&address)
            .ok_or(KernelError::InvalidState("unmapped handle array"))?;
        if count > array.len() {
            return Err(KernelError::OutOfRange("handle array shorter than count"));
        }
        Ok(array[..count].to_vec())
    }

    fn write_handles(&self, address: u64, handles: &[Handle]) -> KernelResult<()> {
        self.handle_arrays.insert(address, handles.to_vec());
        Ok(())
    }
}
