//! Guest kernel emulation.
//!
//! [`DeviceState`] is the session root. It owns the [`Scheduler`], every
//! [`GuestProcess`] and the id allocators, and receives supervisor calls from
//! the execution engine. Kernel objects are reference counted and named by
//! stable ids; handle tables and wait queues hold references, nothing frees an
//! object directly.
#[macro_use]
mod macros;

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod handle_table;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod snapshot;
pub mod svc;
pub mod tracer;
pub mod types;

pub use config::KernelConfig;
pub use device::{DeviceState, ThreadSpec};
pub use engine::{ExecutionEngine, GuestContext, GuestResult, HostThreadEngine, NullEngine};
pub use error::{KernelError, KernelResult, ResultCode, WaitOutcome};
pub use memory::{HostMemory, MemoryManager};
pub use scheduler::Scheduler;
pub use snapshot::KernelSnapshot;
pub use types::{
    CoreId, CoreMask, GuestProcess, GuestThread, Handle, ObjectId, Priority, ProcessId,
    SyncObject, ThreadId, ThreadStatus,
};
