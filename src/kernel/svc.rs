//! Supervisor-call decoding and dispatch.
//!
//! Register convention: `w0` carries the result word on return. Calls that
//! produce values return them in `x1`/`x2` and take their inputs from `x1`
//! onward; calls without outputs take their inputs from `x0`.
use crate::utils::{sync::Arc, timeout_from_nanos};
use std::{fmt, time::Duration};
use tracing::debug;

use super::{
    device::{DeviceState, ThreadSpec},
    error::{KernelError, KernelResult, ResultCode, WaitOutcome},
    handle_table::KernelObject,
    types::{
        validate_priority, CoreId, CoreMask, GuestProcess, GuestThread, Handle, ObjectKind,
        ProcessId, SyncObject,
    },
};

/// `SleepThread` argument: yield, allowing a move to an idle core.
pub const YIELD_WITH_MIGRATION: i64 = -1;
/// `SleepThread` argument: same as [`YIELD_WITH_MIGRATION`].
pub const YIELD_TO_ANY_THREAD: i64 = -2;

/// `CreateThread` core argument: any core.
pub const CORE_ANY: i32 = -1;
/// `CreateThread`/`SetThreadCoreMask` core argument: the process default core.
pub const CORE_PROCESS_DEFAULT: i32 = -2;
/// `SetThreadCoreMask` core argument: keep the current ideal core.
pub const CORE_KEEP_IDEAL: i32 = -1;
/// `SetThreadCoreMask` core argument: no ideal core.
pub const CORE_NO_IDEAL: i32 = -2;
/// `SetThreadCoreMask` core argument: the process default core.
pub const CORE_MASK_PROCESS_DEFAULT: i32 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCall {
    ExitProcess,
    CreateThread {
        entry: u64,
        argument: u64,
        stack_top: u64,
        priority: u32,
        core: i32,
    },
    StartThread(Handle),
    ExitThread,
    SleepThread(i64),
    GetThreadPriority(Handle),
    SetThreadPriority { handle: Handle, priority: u32 },
    GetThreadCoreMask(Handle),
    SetThreadCoreMask { handle: Handle, core: i32, mask: u64 },
    GetCurrentProcessorNumber,
    SignalEvent(Handle),
    ClearEvent(Handle),
    CloseHandle(Handle),
    ResetSignal(Handle),
    WaitSynchronization {
        handles_address: u64,
        count: u32,
        timeout_ns: i64,
    },
    CancelSynchronization(Handle),
    ArbitrateLock(Handle),
    ArbitrateUnlock(Handle),
    GetProcessId(Handle),
    GetThreadId(Handle),
    CreateEvent { auto_reset: bool },
    CreateMutex,
    CreateSemaphore { initial: u32, max: u32 },
    SignalSemaphore { handle: Handle, count: u32 },
    OpenProcess(ProcessId),
}

fn w(reg: u64) -> u32 {
    reg as u32
}

fn handle(reg: u64) -> Handle {
    Handle(reg as u32)
}

impl SupervisorCall {
    /// Decode call `number` from the guest's argument registers.
    pub fn decode(number: u32, x: &[u64; 8]) -> KernelResult<Self> {
        use SupervisorCall::*;
        Ok(match number {
            0x07 => ExitProcess,
            0x08 => CreateThread {
                entry: x[1],
                argument: x[2],
                stack_top: x[3],
                priority: w(x[4]),
                core: w(x[5]) as i32,
            },
            0x09 => StartThread(handle(x[0])),
            0x0A => ExitThread,
            0x0B => SleepThread(x[0] as i64),
            0x0C => GetThreadPriority(handle(x[1])),
            0x0D => SetThreadPriority {
                handle: handle(x[0]),
                priority: w(x[1]),
            },
            0x0E => GetThreadCoreMask(handle(x[2])),
            0x0F => SetThreadCoreMask {
                handle: handle(x[0]),
                core: w(x[1]) as i32,
                mask: x[2],
            },
            0x10 => GetCurrentProcessorNumber,
            0x11 => SignalEvent(handle(x[0])),
            0x12 => ClearEvent(handle(x[0])),
            0x16 => CloseHandle(handle(x[0])),
            0x17 => ResetSignal(handle(x[0])),
            0x18 => WaitSynchronization {
                handles_address: x[1],
                count: w(x[2]),
                timeout_ns: x[3] as i64,
            },
            0x19 => CancelSynchronization(handle(x[0])),
            0x1A => ArbitrateLock(handle(x[0])),
            0x1B => ArbitrateUnlock(handle(x[0])),
            0x24 => GetProcessId(handle(x[1])),
            0x25 => GetThreadId(handle(x[1])),
            0x45 => CreateEvent {
                auto_reset: w(x[1]) != 0,
            },
            0x80 => CreateMutex,
            0x81 => CreateSemaphore {
                initial: w(x[1]),
                max: w(x[2]),
            },
            0x82 => SignalSemaphore {
                handle: handle(x[0]),
                count: w(x[1]),
            },
            0x83 => OpenProcess(ProcessId(x[1])),
            other => return Err(KernelError::UnknownSupervisorCall(other)),
        })
    }

    /// Argument registers as guest code would set them up for this call.
    pub fn encode(&self) -> [u64; 8] {
        use SupervisorCall::*;
        let mut x = [0u64; 8];
        match *self {
            ExitProcess | ExitThread | GetCurrentProcessorNumber | CreateMutex => {}
            CreateThread {
                entry,
                argument,
                stack_top,
                priority,
                core,
            } => {
                x[1] = entry;
                x[2] = argument;
                x[3] = stack_top;
                x[4] = priority as u64;
                x[5] = core as u32 as u64;
            }
            StartThread(h) | SignalEvent(h) | ClearEvent(h) | CloseHandle(h)
            | ResetSignal(h) | CancelSynchronization(h) | ArbitrateLock(h)
            | ArbitrateUnlock(h) => x[0] = h.raw() as u64,
            SleepThread(ns) => x[0] = ns as u64,
            GetThreadPriority(h) | GetProcessId(h) | GetThreadId(h) => x[1] = h.raw() as u64,
            SetThreadPriority { handle, priority } => {
                x[0] = handle.raw() as u64;
                x[1] = priority as u64;
            }
            GetThreadCoreMask(h) => x[2] = h.raw() as u64,
            SetThreadCoreMask { handle, core, mask } => {
                x[0] = handle.raw() as u64;
                x[1] = core as u32 as u64;
                x[2] = mask;
            }
            WaitSynchronization {
                handles_address,
                count,
                timeout_ns,
            } => {
                x[1] = handles_address;
                x[2] = count as u64;
                x[3] = timeout_ns as u64;
            }
            CreateEvent { auto_reset } => x[1] = auto_reset as u64,
            CreateSemaphore { initial, max } => {
                x[1] = initial as u64;
                x[2] = max as u64;
            }
            SignalSemaphore { handle, count } => {
                x[0] = handle.raw() as u64;
                x[1] = count as u64;
            }
            OpenProcess(id) => x[1] = id.0,
        }
        x
    }

    pub fn number(&self) -> u32 {
        use SupervisorCall::*;
        match self {
            ExitProcess => 0x07,
            CreateThread { .. } => 0x08,
            StartThread(_) => 0x09,
            ExitThread => 0x0A,
            SleepThread(_) => 0x0B,
            GetThreadPriority(_) => 0x0C,
            SetThreadPriority { .. } => 0x0D,
            GetThreadCoreMask(_) => 0x0E,
            SetThreadCoreMask { .. } => 0x0F,
            GetCurrentProcessorNumber => 0x10,
            SignalEvent(_) => 0x11,
            ClearEvent(_) => 0x12,
            CloseHandle(_) => 0x16,
            ResetSignal(_) => 0x17,
            WaitSynchronization { .. } => 0x18,
            CancelSynchronization(_) => 0x19,
            ArbitrateLock(_) => 0x1A,
            ArbitrateUnlock(_) => 0x1B,
            GetProcessId(_) => 0x24,
            GetThreadId(_) => 0x25,
            CreateEvent { .. } => 0x45,
            CreateMutex => 0x80,
            CreateSemaphore { .. } => 0x81,
            SignalSemaphore { .. } => 0x82,
            OpenProcess(_) => 0x83,
        }
    }
}

impl fmt::Display for SupervisorCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc 0x{:02X} {:?}", self.number(), self)
    }
}

fn owning_process(thread: &GuestThread) -> KernelResult<Arc<GuestProcess>> {
    thread
        .process()
        .ok_or(KernelError::InvalidState("thread has no process"))
}

fn lookup(process: &GuestProcess, h: Handle) -> KernelResult<KernelObject> {
    process.handles().get(h)
}

fn resolve_thread(
    process: &GuestProcess,
    caller: &Arc<GuestThread>,
    h: Handle,
) -> KernelResult<Arc<GuestThread>> {
    if h == Handle::CURRENT_THREAD {
        return Ok(caller.clone());
    }
    match lookup(process, h)? {
        KernelObject::Thread(t) => Ok(t),
        _ => Err(KernelError::InvalidHandle(h.raw())),
    }
}

fn resolve_process(
    process: &Arc<GuestProcess>,
    h: Handle,
) -> KernelResult<Arc<GuestProcess>> {
    if h == Handle::CURRENT_PROCESS {
        return Ok(process.clone());
    }
    match lookup(process, h)? {
        KernelObject::Process(p) => Ok(p),
        KernelObject::Thread(t) => owning_process(&t),
        KernelObject::Sync(_) => Err(KernelError::InvalidHandle(h.raw())),
    }
}

/// Resolve a handle to something a thread can wait on. A process waits on
/// its exit signal; threads are not waitable.
fn resolve_waitable(process: &Arc<GuestProcess>, h: Handle) -> KernelResult<Arc<SyncObject>> {
    if h == Handle::CURRENT_PROCESS {
        return Ok(process.exit_signal().clone());
    }
    match lookup(process, h)? {
        KernelObject::Sync(o) => Ok(o),
        KernelObject::Process(p) => Ok(p.exit_signal().clone()),
        KernelObject::Thread(_) => Err(KernelError::InvalidHandle(h.raw())),
    }
}

fn resolve_kind(process: &GuestProcess, h: Handle, kind: ObjectKind) -> KernelResult<Arc<SyncObject>> {
    match lookup(process, h)? {
        KernelObject::Sync(o) if o.kind() == kind => Ok(o),
        _ => Err(KernelError::InvalidHandle(h.raw())),
    }
}

fn core_index(state: &DeviceState, core: i32) -> KernelResult<CoreId> {
    usize::try_from(core)
        .ok()
        .filter(|&c| c < state.scheduler().core_count())
        .map(CoreId)
        .ok_or(KernelError::InvalidCoreId(core))
}

/// Execute a decoded call on behalf of `thread`. Output values are written to
/// `x`; the returned code is the guest-visible result for calls whose
/// non-error outcome is not plain success (a wait that timed out).
pub(crate) fn dispatch(
    state: &DeviceState,
    thread: &Arc<GuestThread>,
    call: SupervisorCall,
    x: &mut [u64; 8],
) -> KernelResult<ResultCode> {
    use SupervisorCall::*;
    let scheduler = state.scheduler();
    let process = owning_process(thread)?;

    match call {
        ExitProcess => {
            state.terminate_process(&process, Some(thread));
            return Err(KernelError::TerminationRequested);
        }
        CreateThread {
            entry,
            argument,
            stack_top,
            priority,
            core,
        } => {
            let priority = validate_priority(priority)?;
            let (ideal, mask) = match core {
                CORE_ANY => (None, CoreMask::all(scheduler.core_count())),
                CORE_PROCESS_DEFAULT => {
                    let core = process.default_core();
                    (Some(core), CoreMask::single(core))
                }
                c => {
                    let core = core_index(state, c)?;
                    (Some(core), CoreMask::single(core))
                }
            };
            let spec = ThreadSpec {
                entry,
                argument,
                stack_top,
                priority,
                ideal_core: ideal,
                affinity: mask,
            };
            let created = state.create_thread(&process, spec)?;
            let inserted = process
                .handles()
                .insert(KernelObject::Thread(created.clone()));
            match inserted {
                Ok(h) => x[1] = h.raw() as u64,
                Err(e) => {
                    state.exit_thread(&created);
                    return Err(e);
                }
            }
        }
        StartThread(h) => {
            let target = resolve_thread(&process, thread, h)?;
            state.start_thread(&target)?;
        }
        ExitThread => {
            state.exit_thread(thread);
            return Err(KernelError::TerminationRequested);
        }
        SleepThread(0) => scheduler.yield_thread(thread)?,
        SleepThread(YIELD_WITH_MIGRATION | YIELD_TO_ANY_THREAD) => {
            scheduler.yield_with_migration(thread)?
        }
        SleepThread(ns) if ns > 0 => {
            scheduler.sleep(thread, Duration::from_nanos(ns as u64))?
        }
        SleepThread(_) => return Err(KernelError::OutOfRange("sleep duration")),
        GetThreadPriority(h) => {
            let target = resolve_thread(&process, thread, h)?;
            x[1] = target.base_priority() as u64;
        }
        SetThreadPriority { handle, priority } => {
            let target = resolve_thread(&process, thread, handle)?;
            scheduler.update_priority(&target, validate_priority(priority)?)?;
        }
        GetThreadCoreMask(h) => {
            let target = resolve_thread(&process, thread, h)?;
            x[1] = target.ideal_core().map_or(-1, |c| c.index() as i32) as u32 as u64;
            x[2] = target.affinity().0;
        }
        SetThreadCoreMask { handle, core, mask } => {
            let target = resolve_thread(&process, thread, handle)?;
            let mask = CoreMask(mask);
            let ideal = match core {
                CORE_KEEP_IDEAL => target.ideal_core().filter(|&c| mask.contains(c)),
                CORE_NO_IDEAL => None,
                CORE_MASK_PROCESS_DEFAULT => Some(process.default_core()),
                c => Some(core_index(state, c)?),
            };
            scheduler.update_affinity(&target, ideal, mask)?;
        }
        GetCurrentProcessorNumber => {
            x[1] = thread.current_core().map_or(0, |c| c.index() as u64);
        }
        SignalEvent(h) => {
            let event = resolve_kind(&process, h, ObjectKind::Event)?;
            scheduler.signal_event(&event)?;
        }
        ClearEvent(h) => {
            let event = resolve_kind(&process, h, ObjectKind::Event)?;
            scheduler.clear_event(&event)?;
        }
        ResetSignal(h) => {
            let event = resolve_kind(&process, h, ObjectKind::Event)?;
            if !scheduler.clear_event(&event)? {
                return Err(KernelError::InvalidState("event was not signaled"));
            }
        }
        CloseHandle(h) => {
            if h != Handle::CURRENT_PROCESS && h != Handle::CURRENT_THREAD {
                let closed = process.handles().close(h)?;
                debug!("{} closed {} handle {}", thread.id(), closed.type_name(), h);
            }
        }
        WaitSynchronization {
            handles_address,
            count,
            timeout_ns,
        } => {
            let count = count as usize;
            if count > state.config().max_wait_objects {
                return Err(KernelError::OutOfRange("too many handles in one wait"));
            }
            let handles = state.memory().read_handles(handles_address, count)?;
            let objects = handles
                .iter()
                .map(|&h| resolve_waitable(&process, h))
                .collect::<KernelResult<Vec<_>>>()?;
            match scheduler.wait_any(thread, &objects, timeout_from_nanos(timeout_ns))? {
                WaitOutcome::Signaled { index } => x[1] = index as u64,
                WaitOutcome::TimedOut => return Ok(ResultCode::TIMED_OUT),
            }
        }
        CancelSynchronization(h) => {
            let target = resolve_thread(&process, thread, h)?;
            scheduler.cancel_wait(&target);
        }
        ArbitrateLock(h) => {
            let mutex = resolve_kind(&process, h, ObjectKind::Mutex)?;
            scheduler.acquire_mutex(thread, &mutex, None)?;
        }
        ArbitrateUnlock(h) => {
            let mutex = resolve_kind(&process, h, ObjectKind::Mutex)?;
            scheduler.release_mutex(thread, &mutex)?;
        }
        GetProcessId(h) => x[1] = resolve_process(&process, h)?.id().0,
        GetThreadId(h) => x[1] = resolve_thread(&process, thread, h)?.id().0,
        CreateEvent { auto_reset } => {
            let event = state.create_event(auto_reset);
            let mut handles = process.handles();
            let writable = handles.insert(KernelObject::Sync(event.clone()))?;
            match handles.insert(KernelObject::Sync(event)) {
                Ok(readable) => {
                    x[1] = writable.raw() as u64;
                    x[2] = readable.raw() as u64;
                }
                Err(e) => {
                    handles.close(writable)?;
                    return Err(e);
                }
            }
        }
        CreateMutex => {
            let mutex = state.create_mutex();
            x[1] = process.handles().insert(KernelObject::Sync(mutex))?.raw() as u64;
        }
        CreateSemaphore { initial, max } => {
            let semaphore = state.create_semaphore(initial, max)?;
            x[1] = process.handles().insert(KernelObject::Sync(semaphore))?.raw() as u64;
        }
        SignalSemaphore { handle, count } => {
            let semaphore = resolve_kind(&process, handle, ObjectKind::Semaphore)?;
            x[1] = scheduler.signal_semaphore(&semaphore, count)? as u64;
        }
        OpenProcess(id) => {
            let target = state
                .process(id)
                .ok_or(KernelError::OutOfRange("no live process with that id"))?;
            x[1] = state.open_process(&process, &target)?.raw() as u64;
        }
    }
    Ok(ResultCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reads_guest_registers() {
        let mut x = [0u64; 8];
        x[1] = 0x8000_0000;
        x[2] = 7;
        x[3] = 0x1_0000;
        x[4] = 44;
        x[5] = (-2i32) as u32 as u64;
        assert_eq!(
            SupervisorCall::decode(0x08, &x).unwrap(),
            SupervisorCall::CreateThread {
                entry: 0x8000_0000,
                argument: 7,
                stack_top: 0x1_0000,
                priority: 44,
                core: CORE_PROCESS_DEFAULT,
            }
        );

        let mut x = [0u64; 8];
        x[0] = (-1i64) as u64;
        assert_eq!(
            SupervisorCall::decode(0x0B, &x).unwrap(),
            SupervisorCall::SleepThread(YIELD_WITH_MIGRATION)
        );
    }

    #[test]
    fn test_encode_matches_decode() {
        let calls = [
            SupervisorCall::SetThreadCoreMask {
                handle: Handle(0xD001),
                core: CORE_NO_IDEAL,
                mask: 0b1010,
            },
            SupervisorCall::WaitSynchronization {
                handles_address: 0x7000_1000,
                count: 3,
                timeout_ns: -1,
            },
            SupervisorCall::GetThreadCoreMask(Handle::CURRENT_THREAD),
            SupervisorCall::CreateEvent { auto_reset: true },
            SupervisorCall::OpenProcess(ProcessId(3)),
        ];
        for call in calls {
            assert_eq!(SupervisorCall::decode(call.number(), &call.encode()), Ok(call));
        }
    }

    #[test]
    fn test_unknown_call_is_rejected() {
        let err = SupervisorCall::decode(0x7F, &[0; 8]).unwrap_err();
        assert_eq!(err, KernelError::UnknownSupervisorCall(0x7F));
        assert_eq!(err.result_code(), ResultCode::INVALID_ENUM_VALUE);
        assert_eq!(err.to_string(), "unknown supervisor call 0x7F");
    }
}
