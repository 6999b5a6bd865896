//! The execution-engine side of the kernel.
//!
//! An engine runs guest code for started threads. It owes the scheduler two
//! things: it must call [`GuestContext::safe_point`] at instruction-block
//! boundaries (supervisor calls do this on their own), and it must retire a
//! thread through [`DeviceState::exit_thread`] once its code stops running.
use crate::utils::{
    nanos_from_timeout,
    sync::{set_current_guest_thread, Arc, AtomicU64, Mutex, Ordering},
};
use dashmap::DashMap;
use std::{fmt, thread::JoinHandle, time::Duration};
use tracing::{debug, trace, warn};

use super::{
    device::DeviceState,
    error::{KernelError, KernelResult, ResultCode, WaitOutcome},
    svc::SupervisorCall,
    types::{GuestThread, Handle, ProcessId, ThreadId},
};

pub trait ExecutionEngine: Send + Sync {
    /// Begin executing `thread`, which has just been queued on a core.
    fn launch(&self, state: &Arc<DeviceState>, thread: &Arc<GuestThread>) -> KernelResult<()>;

    /// Asynchronous preemption request. The thread's `pending_yield` flag is
    /// already set; the engine should bring it to a safe point soon.
    ///
    /// Called with scheduler locks held, so it must not call back into the
    /// scheduler.
    fn interrupt(&self, _thread: &GuestThread) {}

    /// Wait for every host thread this engine started. Never called from a
    /// guest thread.
    fn join(&self) {}
}

/// Engine that runs nothing. Threads are driven by the caller's own host
/// threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

impl ExecutionEngine for NullEngine {
    fn launch(&self, _state: &Arc<DeviceState>, _thread: &Arc<GuestThread>) -> KernelResult<()> {
        Ok(())
    }
}

/// Guest code for the host-thread engine: a closure standing in for the
/// instructions at an entry address.
pub type GuestEntry = Arc<dyn Fn(&GuestContext) -> GuestResult<()> + Send + Sync>;

/// What a guest observes from a supervisor call: its result word.
pub type GuestResult<T> = Result<T, ResultCode>;

/// Runs every guest thread on a dedicated, named host thread.
#[derive(Default)]
pub struct HostThreadEngine {
    entries: DashMap<u64, GuestEntry>,
    host_threads: Mutex<Vec<JoinHandle<()>>>,
    interrupts: AtomicU64,
}

impl HostThreadEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `body` the guest code at `address`.
    pub fn register_entry<F>(&self, address: u64, body: F)
    where
        F: Fn(&GuestContext) -> GuestResult<()> + Send + Sync + 'static,
    {
        self.entries.insert(address, Arc::new(body));
    }

    /// Number of preemption requests delivered so far.
    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }

    /// Wait for every host thread launched so far, including ones launched
    /// while waiting.
    pub fn join_all(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.host_threads.lock());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if handle.join().is_err() {
                    warn!("guest host thread panicked");
                }
            }
        }
    }
}

impl fmt::Debug for HostThreadEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostThreadEngine")
            .field("entries", &self.entries.len())
            .field("interrupts", &self.interrupt_count())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine for HostThreadEngine {
    fn launch(&self, state: &Arc<DeviceState>, thread: &Arc<GuestThread>) -> KernelResult<()> {
        let body = self
            .entries
            .get(&thread.entry())
            .map(|entry| entry.value().clone())
            .ok_or(KernelError::InvalidState("no guest code at entry address"))?;

        let ctx = GuestContext::new(state.clone(), thread.clone());
        let handle = std::thread::Builder::new()
            .name(format!("guest-{}", thread.id()))
            .spawn(move || {
                let id = ctx.thread().id();
                set_current_guest_thread(Some(id.0));
                let outcome = match ctx.state().scheduler().wait_schedule(ctx.thread()) {
                    Ok(_) => body(&ctx),
                    Err(e) => Err(e.result_code()),
                };
                match outcome {
                    Ok(()) => debug!("{} returned", id),
                    Err(ResultCode::TERMINATION_REQUESTED) => debug!("{} terminated", id),
                    Err(rc) => debug!("{} ended with {}", id, rc),
                }
                ctx.state().exit_thread(ctx.thread());
                set_current_guest_thread(None);
            })
            .map_err(|_| KernelError::OutOfResource("host thread"))?;

        self.host_threads.lock().push(handle);
        Ok(())
    }

    fn interrupt(&self, thread: &GuestThread) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        trace!("interrupt delivered to {}", thread.id());
    }

    fn join(&self) {
        self.join_all();
    }
}

/// A guest thread's view of the kernel: raw supervisor calls plus typed
/// wrappers that marshal registers the way guest code would.
pub struct GuestContext {
    state: Arc<DeviceState>,
    thread: Arc<GuestThread>,
}

impl GuestContext {
    /// Guest address of the per-thread scratch area used to pass handle
    /// arrays to `WaitSynchronization`.
    const SCRATCH_BASE: u64 = 0x7000_0000;

    pub fn new(state: Arc<DeviceState>, thread: Arc<GuestThread>) -> Self {
        Self { state, thread }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn thread(&self) -> &Arc<GuestThread> {
        &self.thread
    }

    pub fn argument(&self) -> u64 {
        self.thread.argument()
    }

    /// Instruction-block boundary.
    pub fn safe_point(&self) -> GuestResult<()> {
        Ok(self.state.safe_point(&self.thread)?)
    }

    /// Issue supervisor call `number` with `regs` as x0..x7.
    pub fn svc(&self, number: u32, regs: &mut [u64; 8]) -> ResultCode {
        self.state.on_supervisor_call(&self.thread, number, regs)
    }

    fn call(&self, call: SupervisorCall) -> GuestResult<[u64; 8]> {
        let mut regs = call.encode();
        let rc = self.svc(call.number(), &mut regs);
        if rc.is_success() {
            Ok(regs)
        } else {
            Err(rc)
        }
    }

    pub fn exit_process(&self) -> GuestResult<()> {
        self.call(SupervisorCall::ExitProcess).map(drop)
    }

    pub fn create_thread(
        &self,
        entry: u64,
        argument: u64,
        stack_top: u64,
        priority: u32,
        core: i32,
    ) -> GuestResult<Handle> {
        let regs = self.call(SupervisorCall::CreateThread {
            entry,
            argument,
            stack_top,
            priority,
            core,
        })?;
        Ok(Handle(regs[1] as u32))
    }

    pub fn start_thread(&self, handle: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::StartThread(handle)).map(drop)
    }

    pub fn exit_thread(&self) -> GuestResult<()> {
        self.call(SupervisorCall::ExitThread).map(drop)
    }

    /// `SleepThread`: `0` yields, [`super::svc::YIELD_WITH_MIGRATION`] may move the
    /// thread to an idle core, anything positive sleeps.
    pub fn sleep(&self, nanos: i64) -> GuestResult<()> {
        self.call(SupervisorCall::SleepThread(nanos)).map(drop)
    }

    pub fn yield_now(&self) -> GuestResult<()> {
        self.sleep(0)
    }

    pub fn thread_priority(&self, handle: Handle) -> GuestResult<u32> {
        let regs = self.call(SupervisorCall::GetThreadPriority(handle))?;
        Ok(regs[1] as u32)
    }

    pub fn set_thread_priority(&self, handle: Handle, priority: u32) -> GuestResult<()> {
        self.call(SupervisorCall::SetThreadPriority { handle, priority })
            .map(drop)
    }

    /// Returns the ideal core (`-1` for none) and the affinity mask.
    pub fn thread_core_mask(&self, handle: Handle) -> GuestResult<(i32, u64)> {
        let regs = self.call(SupervisorCall::GetThreadCoreMask(handle))?;
        Ok((regs[1] as u32 as i32, regs[2]))
    }

    pub fn set_thread_core_mask(&self, handle: Handle, core: i32, mask: u64) -> GuestResult<()> {
        self.call(SupervisorCall::SetThreadCoreMask { handle, core, mask })
            .map(drop)
    }

    pub fn current_processor(&self) -> GuestResult<u32> {
        let regs = self.call(SupervisorCall::GetCurrentProcessorNumber)?;
        Ok(regs[1] as u32)
    }

    pub fn signal_event(&self, handle: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::SignalEvent(handle)).map(drop)
    }

    pub fn clear_event(&self, handle: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::ClearEvent(handle)).map(drop)
    }

    pub fn reset_signal(&self, handle: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::ResetSignal(handle)).map(drop)
    }

    pub fn close_handle(&self, handle: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::CloseHandle(handle)).map(drop)
    }

    /// `WaitSynchronization`. A negative `timeout_ns` waits forever; a
    /// timeout is reported as [`WaitOutcome::TimedOut`], not as an error.
    pub fn wait_synchronization(&self, handles: &[Handle], timeout_ns: i64) -> GuestResult<WaitOutcome> {
        let address = Self::SCRATCH_BASE + self.thread.id().0 * 0x1000;
        self.state.memory().write_handles(address, handles)?;
        let call = SupervisorCall::WaitSynchronization {
            handles_address: address,
            count: handles.len() as u32,
            timeout_ns,
        };
        match self.call(call) {
            Ok(regs) => Ok(WaitOutcome::Signaled {
                index: regs[1] as usize,
            }),
            Err(ResultCode::TIMED_OUT) => Ok(WaitOutcome::TimedOut),
            Err(rc) => Err(rc),
        }
    }

    /// [`wait_synchronization`](Self::wait_synchronization) with a host
    /// timeout; `None` waits forever.
    pub fn wait_for(&self, handles: &[Handle], timeout: Option<Duration>) -> GuestResult<WaitOutcome> {
        self.wait_synchronization(handles, nanos_from_timeout(timeout))
    }

    pub fn cancel_synchronization(&self, thread: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::CancelSynchronization(thread))
            .map(drop)
    }

    pub fn arbitrate_lock(&self, mutex: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::ArbitrateLock(mutex)).map(drop)
    }

    pub fn arbitrate_unlock(&self, mutex: Handle) -> GuestResult<()> {
        self.call(SupervisorCall::ArbitrateUnlock(mutex)).map(drop)
    }

    pub fn process_id(&self, handle: Handle) -> GuestResult<ProcessId> {
        let regs = self.call(SupervisorCall::GetProcessId(handle))?;
        Ok(ProcessId(regs[1]))
    }

    pub fn thread_id(&self, handle: Handle) -> GuestResult<ThreadId> {
        let regs = self.call(SupervisorCall::GetThreadId(handle))?;
        Ok(ThreadId(regs[1]))
    }

    /// Returns the writable and readable handles of a new event.
    pub fn create_event(&self, auto_reset: bool) -> GuestResult<(Handle, Handle)> {
        let regs = self.call(SupervisorCall::CreateEvent { auto_reset })?;
        Ok((Handle(regs[1] as u32), Handle(regs[2] as u32)))
    }

    pub fn create_mutex(&self) -> GuestResult<Handle> {
        let regs = self.call(SupervisorCall::CreateMutex)?;
        Ok(Handle(regs[1] as u32))
    }

    pub fn create_semaphore(&self, initial: u32, max: u32) -> GuestResult<Handle> {
        let regs = self.call(SupervisorCall::CreateSemaphore { initial, max })?;
        Ok(Handle(regs[1] as u32))
    }

    /// Returns how many waiters were released.
    pub fn signal_semaphore(&self, handle: Handle, count: u32) -> GuestResult<usize> {
        let regs = self.call(SupervisorCall::SignalSemaphore { handle, count })?;
        Ok(regs[1] as usize)
    }

    /// A handle to another live process; waiting on it waits for its exit.
    pub fn open_process(&self, id: ProcessId) -> GuestResult<Handle> {
        let regs = self.call(SupervisorCall::OpenProcess(id))?;
        Ok(Handle(regs[1] as u32))
    }
}

impl fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestContext")
            .field("thread", &self.thread.id())
            .finish_non_exhaustive()
    }
}
