use crate::utils::sync::{current_guest_thread, Arc, AtomicU64, Ordering, Weak};
use dashmap::DashMap;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{
    config::KernelConfig,
    engine::ExecutionEngine,
    error::{KernelError, KernelResult, ResultCode},
    handle_table::KernelObject,
    memory::MemoryManager,
    metrics::SchedulerMetrics,
    scheduler::Scheduler,
    snapshot::{KernelSnapshot, ObjectSnapshot, ProcessSnapshot, ThreadSnapshot},
    svc::{self, SupervisorCall},
    tracer::Tracer,
    types::{
        thread::ThreadParams, CoreId, CoreMask, EventState, ExitSignalState, GuestProcess,
        GuestThread, Handle, MutexState, ObjectId, Priority, ProcessId, ProcessState,
        SemaphoreState, SyncObject, SyncState, ThreadId,
    },
};

/// Everything needed to create a guest thread besides its process.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSpec {
    pub entry: u64,
    pub argument: u64,
    pub stack_top: u64,
    pub priority: Priority,
    pub ideal_core: Option<CoreId>,
    pub affinity: CoreMask,
}

/// Root of one emulation session: owns the scheduler, every process, and the
/// id allocators, and is the entry point for the execution engine's traps.
pub struct DeviceState {
    config: KernelConfig,
    scheduler: Scheduler,
    engine: Arc<dyn ExecutionEngine>,
    memory: Arc<dyn MemoryManager>,
    metrics: Arc<SchedulerMetrics>,
    tracer: Arc<Tracer>,
    processes: DashMap<ProcessId, Arc<GuestProcess>>,
    /// Every waitable object by id; an entry does not keep its object alive
    objects: DashMap<ObjectId, Weak<SyncObject>>,
    next_process: AtomicU64,
    next_thread: AtomicU64,
    next_object: AtomicU64,
    this: Weak<DeviceState>,
}

impl DeviceState {
    /// New session with the tracer configured from the environment.
    pub fn new(
        config: KernelConfig,
        engine: Arc<dyn ExecutionEngine>,
        memory: Arc<dyn MemoryManager>,
    ) -> Arc<Self> {
        Self::with_tracer(config, engine, memory, Tracer::new())
    }

    pub fn with_tracer(
        config: KernelConfig,
        engine: Arc<dyn ExecutionEngine>,
        memory: Arc<dyn MemoryManager>,
        tracer: Tracer,
    ) -> Arc<Self> {
        let metrics = Arc::new(SchedulerMetrics::new());
        let tracer = Arc::new(tracer);
        let scheduler = Scheduler::new(&config, engine.clone(), metrics.clone(), tracer.clone());
        info!(
            "kernel session: {} core(s), {:?} time slice",
            config.core_count, config.time_slice
        );
        Arc::new_cyclic(|this| Self {
            config,
            scheduler,
            engine,
            memory,
            metrics,
            tracer,
            processes: DashMap::new(),
            objects: DashMap::new(),
            next_process: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn process(&self, id: ProcessId) -> Option<Arc<GuestProcess>> {
        self.processes.get(&id).map(|p| p.value().clone())
    }

    pub fn processes(&self) -> Vec<Arc<GuestProcess>> {
        let mut all: Vec<_> = self.processes.iter().map(|p| p.value().clone()).collect();
        all.sort_by_key(|p| p.id());
        all
    }

    /// Give `holder` a handle to `target`. Waiting on it waits for `target`
    /// to exit.
    pub fn open_process(
        &self,
        holder: &GuestProcess,
        target: &Arc<GuestProcess>,
    ) -> KernelResult<Handle> {
        if target.state() == ProcessState::Exited {
            return Err(KernelError::InvalidState("process has already exited"));
        }
        let handle = holder
            .handles()
            .insert(KernelObject::Process(target.clone()))?;
        debug!("{} opened {} as {}", holder.id(), target.id(), handle);
        Ok(handle)
    }

    fn allocate_object(&self, state: impl Into<SyncState>) -> Arc<SyncObject> {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(SyncObject::new(id, state));
        self.objects.insert(id, Arc::downgrade(&object));
        object
    }

    pub fn create_mutex(&self) -> Arc<SyncObject> {
        self.allocate_object(MutexState::default())
    }

    pub fn create_semaphore(&self, initial: u32, max: u32) -> KernelResult<Arc<SyncObject>> {
        if max == 0 {
            return Err(KernelError::OutOfRange("semaphore maximum must be positive"));
        }
        if initial > max {
            return Err(KernelError::InvalidCombination(
                "semaphore initial count above its maximum",
            ));
        }
        Ok(self.allocate_object(SemaphoreState::new(initial, max)))
    }

    pub fn create_event(&self, auto_reset: bool) -> Arc<SyncObject> {
        self.allocate_object(EventState::new(auto_reset))
    }

    pub fn create_process(&self, name: &str) -> Arc<GuestProcess> {
        let id = ProcessId(self.next_process.fetch_add(1, Ordering::Relaxed));
        let exit_signal = self.allocate_object(ExitSignalState::default());
        let process = Arc::new(GuestProcess::new(
            id,
            name,
            self.config.default_core,
            self.config.max_handles_per_process,
            exit_signal,
        ));
        self.processes.insert(id, process.clone());
        debug!("created {} \"{}\"", id, name);
        process
    }

    /// Create a thread in `process`. It stays `Created` until started.
    pub fn create_thread(
        &self,
        process: &Arc<GuestProcess>,
        spec: ThreadSpec,
    ) -> KernelResult<Arc<GuestThread>> {
        let core_count = self.scheduler.core_count();
        if spec.affinity.is_empty() {
            return Err(KernelError::InvalidCombination("empty affinity mask"));
        }
        if !spec.affinity.fits(core_count) {
            return Err(KernelError::InvalidCoreId(-1));
        }
        if let Some(core) = spec.ideal_core {
            if core.index() >= core_count {
                return Err(KernelError::InvalidCoreId(core.index() as i32));
            }
            if !spec.affinity.contains(core) {
                return Err(KernelError::InvalidCombination(
                    "ideal core outside affinity mask",
                ));
            }
        }

        let mut life = process.life();
        if life.state != ProcessState::Running {
            return Err(KernelError::InvalidState("process is exiting"));
        }
        if life.threads.len() >= self.config.max_threads_per_process {
            return Err(KernelError::LimitReached("threads per process"));
        }

        let id = ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed));
        let context = self.memory.create_context(id, spec.stack_top)?;
        let thread = Arc::new(GuestThread::new(ThreadParams {
            id,
            process: Arc::downgrade(process),
            context,
            entry: spec.entry,
            argument: spec.argument,
            stack_top: spec.stack_top,
            priority: spec.priority,
            ideal_core: spec.ideal_core,
            affinity: spec.affinity,
        }));
        life.threads.push(thread.clone());
        drop(life);

        self.tracer
            .trace_thread_create(id, process.id(), spec.priority);
        trace!("created {} in {} at 0x{:X}", id, process.id(), spec.entry);
        Ok(thread)
    }

    /// Queue a created thread and hand it to the execution engine.
    pub fn start_thread(&self, thread: &Arc<GuestThread>) -> KernelResult<CoreId> {
        let core = self.scheduler.add_thread(thread, None)?;
        let launched = match self.this.upgrade() {
            Some(this) => self.engine.launch(&this, thread),
            None => Err(KernelError::InvalidState("session is shutting down")),
        };
        if let Err(e) = launched {
            warn!("failed to launch {}: {}", thread.id(), e);
            self.exit_thread(thread);
            return Err(e);
        }
        Ok(core)
    }

    /// Retire `thread` and release what it holds. Safe to call more than
    /// once; only the first call has an effect.
    pub fn exit_thread(&self, thread: &Arc<GuestThread>) {
        self.scheduler.remove_thread(thread);
        self.finish_exit(thread);
    }

    /// Bookkeeping after a thread is off the scheduler: its context, its
    /// place in the process, and the process exit signal if it was the last.
    fn finish_exit(&self, thread: &Arc<GuestThread>) {
        let Some(process) = thread.process() else {
            return;
        };
        let Some(last) = process.forget_thread(thread.id()) else {
            return;
        };
        self.memory.release_context(thread.context());
        if last {
            process.life().state = ProcessState::Exited;
            self.signal_process_exit(&process);
            let closed = process.handles().clear();
            drop(closed);
            self.retire_process(&process);
        }
    }

    /// Drop the registry's reference to an exited process and forget objects
    /// nothing holds anymore. Handles in other processes keep `process` alive.
    fn retire_process(&self, process: &GuestProcess) {
        self.processes.remove(&process.id());
        self.objects.retain(|_, o| o.strong_count() > 0);
    }

    fn signal_process_exit(&self, process: &GuestProcess) {
        if self.scheduler.fire_exit_signal(process.exit_signal()) {
            self.tracer.trace_process_exit(process.id());
            debug!("{} exited", process.id());
        }
    }

    /// Safe point on behalf of the execution engine. A thread that must
    /// terminate is retired here and `TerminationRequested` returned.
    pub fn safe_point(&self, thread: &Arc<GuestThread>) -> KernelResult<()> {
        match self.scheduler.safe_point(thread) {
            Err(KernelError::TerminationRequested) => {
                self.exit_thread(thread);
                Err(KernelError::TerminationRequested)
            }
            other => other,
        }
    }

    /// Terminate every thread of `process`, then close its handles.
    ///
    /// Threads that are not running are retired at once. Running ones are
    /// interrupted and awaited; teardown cannot complete until each has
    /// reached a safe point. `caller` is a thread of the process asking for
    /// its own process's exit, and is retired last.
    pub fn terminate_process(&self, process: &Arc<GuestProcess>, caller: Option<&Arc<GuestThread>>) {
        {
            let mut life = process.life();
            if life.state != ProcessState::Running {
                return;
            }
            life.state = ProcessState::Exiting;
        }
        let except = caller.map(|t| t.id());
        debug!("terminating {}", process.id());
        crate::kernel_msg!(
            self.tracer,
            "TEARDOWN {} ({} live thread(s))",
            process.id(),
            process.live_thread_count()
        );

        for thread in process.threads() {
            if Some(thread.id()) == except {
                continue;
            }
            if self.scheduler.request_termination(&thread) {
                self.finish_exit(&thread);
            }
        }

        let started = Instant::now();
        loop {
            let alive = process.wait_threads_exited(except, self.config.stall_warning);
            if alive.is_empty() {
                break;
            }
            warn!(
                "{} still waiting on {:?} to reach a safe point after {:?}",
                process.id(),
                alive,
                started.elapsed()
            );
        }

        if let Some(caller) = caller {
            self.exit_thread(caller);
        }
        for thread in process.threads() {
            self.finish_exit(&thread);
        }
        self.signal_process_exit(process);

        let closed = process.handles().clear();
        drop(closed);
        process.life().state = ProcessState::Exited;
        self.retire_process(process);
    }

    /// Trap entry for supervisor calls. Writes the result word to `w0` and
    /// passes the caller through a safe point before returning.
    pub fn on_supervisor_call(
        &self,
        thread: &Arc<GuestThread>,
        number: u32,
        regs: &mut [u64; 8],
    ) -> ResultCode {
        let result = SupervisorCall::decode(number, regs).and_then(|call| {
            trace!("{} {}", thread.id(), call);
            svc::dispatch(self, thread, call, regs)
        });
        let mut rc = match result {
            Ok(rc) => rc,
            Err(e) => {
                match e {
                    KernelError::UnknownSupervisorCall(_) => warn!("{}: {}", thread.id(), e),
                    KernelError::TerminationRequested => {}
                    _ => debug!("{} svc 0x{:02X} failed: {}", thread.id(), number, e),
                }
                e.result_code()
            }
        };
        if rc != ResultCode::TERMINATION_REQUESTED {
            if let Err(e) = self.safe_point(thread) {
                rc = e.result_code();
            }
        }
        regs[0] = rc.raw() as u64;
        rc
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        let processes = self
            .processes()
            .into_iter()
            .map(|p| ProcessSnapshot {
                id: p.id(),
                name: p.name().to_string(),
                state: p.state(),
                handles: p.handles().len(),
                threads: p
                    .threads()
                    .iter()
                    .map(|t| ThreadSnapshot {
                        id: t.id(),
                        status: t.status(),
                        base_priority: t.base_priority(),
                        effective_priority: t.effective_priority(),
                        core: t.current_core(),
                    })
                    .collect(),
            })
            .collect();

        self.objects.retain(|_, o| o.strong_count() > 0);
        let mut objects: Vec<ObjectSnapshot> = self
            .objects
            .iter()
            .filter_map(|o| o.value().upgrade())
            .map(|o| ObjectSnapshot {
                id: o.id(),
                kind: o.kind(),
                signaled: o.is_signaled(),
                owner: o.owner(),
                waiters: o.waiter_ids(),
            })
            .collect();
        objects.sort_by_key(|o| o.id);

        KernelSnapshot {
            scheduler: self.scheduler.snapshot(),
            processes,
            objects,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Terminate every process and join the engine's host threads. From a
    /// guest thread the join is skipped, since it would wait on itself.
    pub fn shutdown(&self) {
        for process in self.processes() {
            self.terminate_process(&process, None);
        }
        match current_guest_thread() {
            None => self.engine.join(),
            Some(id) => warn!("shutdown from guest thread T{}; host threads not joined", id),
        }
        self.tracer.flush();
        info!("kernel session shut down");
    }
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceState")
            .field("cores", &self.scheduler.core_count())
            .field("processes", &self.processes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{
        engine::NullEngine,
        memory::HostMemory,
        types::ThreadStatus,
    };
    use std::{thread, time::Duration};

    fn session(config: KernelConfig) -> (Arc<DeviceState>, Arc<HostMemory>) {
        let memory = Arc::new(HostMemory::new());
        let state = DeviceState::with_tracer(
            config,
            Arc::new(NullEngine),
            memory.clone(),
            Tracer::disabled(),
        );
        (state, memory)
    }

    fn spec(priority: Priority, core: usize) -> ThreadSpec {
        ThreadSpec {
            entry: 0x1000,
            argument: 0,
            stack_top: 0,
            priority,
            ideal_core: Some(CoreId(core)),
            affinity: CoreMask::single(CoreId(core)),
        }
    }

    /// A started thread that owns core 0, driven by the test thread itself.
    fn running_thread(state: &DeviceState, process: &Arc<GuestProcess>) -> Arc<GuestThread> {
        let thread = state.create_thread(process, spec(30, 0)).unwrap();
        state.start_thread(&thread).unwrap();
        state.scheduler().wait_schedule(&thread).unwrap();
        thread
    }

    fn call(state: &DeviceState, thread: &Arc<GuestThread>, request: SupervisorCall) -> (ResultCode, [u64; 8]) {
        let mut regs = request.encode();
        let rc = state.on_supervisor_call(thread, request.number(), &mut regs);
        assert_eq!(regs[0], rc.raw() as u64);
        (rc, regs)
    }

    #[test]
    fn test_create_thread_enforces_limits() {
        let config = KernelConfig {
            max_threads_per_process: 2,
            ..KernelConfig::default()
        };
        let (state, _) = session(config);
        let process = state.create_process("limits");

        state.create_thread(&process, spec(10, 0)).unwrap();
        state.create_thread(&process, spec(10, 1)).unwrap();
        assert_eq!(
            state.create_thread(&process, spec(10, 0)).unwrap_err(),
            KernelError::LimitReached("threads per process")
        );

        let other = state.create_process("masks");
        let bad_core = ThreadSpec {
            affinity: CoreMask(1 << 10),
            ideal_core: None,
            ..spec(10, 0)
        };
        assert!(matches!(
            state.create_thread(&other, bad_core),
            Err(KernelError::InvalidCoreId(_))
        ));
        let empty = ThreadSpec {
            affinity: CoreMask::EMPTY,
            ideal_core: None,
            ..spec(10, 0)
        };
        assert!(matches!(
            state.create_thread(&other, empty),
            Err(KernelError::InvalidCombination(_))
        ));
    }

    #[test]
    fn test_handles_and_identity_calls() {
        let (state, _) = session(KernelConfig::default());
        let process = state.create_process("handles");
        let thread = running_thread(&state, &process);

        let (rc, regs) = call(&state, &thread, SupervisorCall::CreateMutex);
        assert_eq!(rc, ResultCode::SUCCESS);
        let mutex = Handle(regs[1] as u32);
        assert_eq!(mutex, Handle(0xD000));

        let (rc, regs) = call(&state, &thread, SupervisorCall::GetThreadId(Handle::CURRENT_THREAD));
        assert_eq!(rc, ResultCode::SUCCESS);
        assert_eq!(regs[1], thread.id().0);

        let (_, regs) = call(&state, &thread, SupervisorCall::GetProcessId(Handle::CURRENT_PROCESS));
        assert_eq!(regs[1], process.id().0);

        let (rc, _) = call(&state, &thread, SupervisorCall::GetThreadId(mutex));
        assert_eq!(rc, ResultCode::INVALID_HANDLE);

        assert_eq!(call(&state, &thread, SupervisorCall::CloseHandle(mutex)).0, ResultCode::SUCCESS);
        assert_eq!(
            call(&state, &thread, SupervisorCall::CloseHandle(mutex)).0,
            ResultCode::INVALID_HANDLE
        );

        let mut regs = [0u64; 8];
        assert_eq!(
            state.on_supervisor_call(&thread, 0x7F, &mut regs),
            ResultCode::INVALID_ENUM_VALUE
        );
        assert_eq!(regs[0], ResultCode::INVALID_ENUM_VALUE.raw() as u64);
    }

    #[test]
    fn test_priority_and_core_mask_calls() {
        let (state, _) = session(KernelConfig::default().with_core_count(2));
        let process = state.create_process("prio");
        let thread = running_thread(&state, &process);
        let me = Handle::CURRENT_THREAD;

        let set = |priority| SupervisorCall::SetThreadPriority { handle: me, priority };
        assert_eq!(call(&state, &thread, set(12)).0, ResultCode::SUCCESS);
        assert_eq!(call(&state, &thread, set(64)).0, ResultCode::INVALID_PRIORITY);
        let (_, regs) = call(&state, &thread, SupervisorCall::GetThreadPriority(me));
        assert_eq!(regs[1], 12);

        let (_, regs) = call(&state, &thread, SupervisorCall::GetCurrentProcessorNumber);
        assert_eq!(regs[1], 0);

        let widen = SupervisorCall::SetThreadCoreMask {
            handle: me,
            core: crate::kernel::svc::CORE_KEEP_IDEAL,
            mask: 0b11,
        };
        assert_eq!(call(&state, &thread, widen).0, ResultCode::SUCCESS);
        let (_, regs) = call(&state, &thread, SupervisorCall::GetThreadCoreMask(me));
        assert_eq!(regs[1] as u32 as i32, 0);
        assert_eq!(regs[2], 0b11);

        let outside = SupervisorCall::SetThreadCoreMask {
            handle: me,
            core: 5,
            mask: 0b11,
        };
        assert_eq!(call(&state, &thread, outside).0, ResultCode::INVALID_CORE_ID);
    }

    #[test]
    fn test_event_wait_through_supervisor_calls() {
        let (state, memory) = session(KernelConfig::default());
        let process = state.create_process("events");
        let thread = running_thread(&state, &process);

        let (_, regs) = call(&state, &thread, SupervisorCall::CreateEvent { auto_reset: false });
        let (writable, readable) = (Handle(regs[1] as u32), Handle(regs[2] as u32));
        assert_ne!(writable, readable);

        let address = memory.stage_handles(&[readable]);
        let wait = SupervisorCall::WaitSynchronization {
            handles_address: address,
            count: 1,
            timeout_ns: 1_000_000,
        };
        assert_eq!(call(&state, &thread, wait).0, ResultCode::TIMED_OUT);
        assert_eq!(
            call(&state, &thread, SupervisorCall::ResetSignal(readable)).0,
            ResultCode::INVALID_STATE
        );

        assert_eq!(call(&state, &thread, SupervisorCall::SignalEvent(writable)).0, ResultCode::SUCCESS);
        let (rc, regs) = call(&state, &thread, wait);
        assert_eq!(rc, ResultCode::SUCCESS);
        assert_eq!(regs[1], 0);

        assert_eq!(call(&state, &thread, SupervisorCall::ResetSignal(readable)).0, ResultCode::SUCCESS);
        assert_eq!(call(&state, &thread, wait).0, ResultCode::TIMED_OUT);

        let too_many = SupervisorCall::WaitSynchronization {
            handles_address: address,
            count: 65,
            timeout_ns: 0,
        };
        assert_eq!(call(&state, &thread, too_many).0, ResultCode::OUT_OF_RANGE);
    }

    #[test]
    fn test_semaphore_calls_validate_counts() {
        let (state, _) = session(KernelConfig::default());
        let process = state.create_process("semaphores");
        let thread = running_thread(&state, &process);

        let bad = SupervisorCall::CreateSemaphore { initial: 3, max: 2 };
        assert_eq!(call(&state, &thread, bad).0, ResultCode::INVALID_COMBINATION);

        let (_, regs) = call(&state, &thread, SupervisorCall::CreateSemaphore { initial: 1, max: 2 });
        let semaphore = Handle(regs[1] as u32);
        let signal = |count| SupervisorCall::SignalSemaphore { handle: semaphore, count };
        let (rc, regs) = call(&state, &thread, signal(1));
        assert_eq!(rc, ResultCode::SUCCESS);
        assert_eq!(regs[1], 0);
        assert_eq!(call(&state, &thread, signal(1)).0, ResultCode::LIMIT_REACHED);
    }

    #[test]
    fn test_last_thread_exit_fires_process_exit() {
        let (state, memory) = session(KernelConfig::default());
        let process = state.create_process("exit");
        let thread = running_thread(&state, &process);
        assert_eq!(memory.live_contexts(), 1);

        let (rc, _) = call(&state, &thread, SupervisorCall::ExitThread);
        assert_eq!(rc, ResultCode::TERMINATION_REQUESTED);
        assert_eq!(thread.status(), ThreadStatus::Terminated);
        assert_eq!(process.state(), ProcessState::Exited);
        assert!(process.exit_signal().is_signaled());
        assert_eq!(process.live_thread_count(), 0);
        assert_eq!(memory.live_contexts(), 0);

        // Retiring twice changes nothing.
        state.exit_thread(&thread);
        assert_eq!(memory.live_contexts(), 0);
    }

    #[test]
    fn test_terminate_process_waits_for_safe_point() {
        let (state, memory) = session(KernelConfig::default());
        let process = state.create_process("teardown");
        let running = running_thread(&state, &process);
        let idle = state.create_thread(&process, spec(20, 1)).unwrap();

        let driver = {
            let (state, running) = (state.clone(), running.clone());
            thread::spawn(move || {
                while state.safe_point(&running).is_ok() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        state.terminate_process(&process, None);
        driver.join().unwrap();

        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(running.status(), ThreadStatus::Terminated);
        assert_eq!(idle.status(), ThreadStatus::Terminated);
        assert!(process.exit_signal().is_signaled());
        assert!(process.handles().is_empty());
        assert_eq!(memory.live_contexts(), 0);
        assert!(state.process(process.id()).is_none());
        assert_eq!(
            state.create_thread(&process, spec(20, 0)).unwrap_err(),
            KernelError::InvalidState("process is exiting")
        );
    }

    #[test]
    fn test_exited_process_leaves_the_registry() {
        let (state, _) = session(KernelConfig::default());
        let watcher = state.create_process("watcher");
        let process = state.create_process("short");
        let thread = running_thread(&state, &process);
        let (rc, _) = call(&state, &thread, SupervisorCall::CreateMutex);
        assert_eq!(rc, ResultCode::SUCCESS);
        assert_eq!(state.processes().len(), 2);
        // Two exit signals and the mutex.
        assert_eq!(state.objects.len(), 3);

        let handle = state.open_process(&watcher, &process).unwrap();
        call(&state, &thread, SupervisorCall::ExitThread);

        assert!(state.process(process.id()).is_none());
        assert_eq!(state.processes().len(), 1);
        // The watcher's handle keeps the exited process and its signal alive.
        assert_eq!(state.objects.len(), 2);
        assert!(process.exit_signal().is_signaled());
        assert_eq!(
            state.open_process(&watcher, &process).unwrap_err(),
            KernelError::InvalidState("process has already exited")
        );

        let closed = watcher.handles().close(handle).unwrap();
        assert_eq!(closed.type_name(), "process");
        drop(closed);
        drop(process);
        state.snapshot();
        assert_eq!(state.objects.len(), 1);
    }

    #[test]
    fn test_snapshot_reports_waiters() {
        let (state, _) = session(KernelConfig::default());
        let process = state.create_process("snapshot");
        let thread = running_thread(&state, &process);
        let mutex = state.create_mutex();
        state
            .scheduler()
            .acquire_mutex(&thread, &mutex, None)
            .unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.processes.len(), 1);
        assert_eq!(snapshot.processes[0].threads[0].status, ThreadStatus::Running);
        let entry = snapshot
            .objects
            .iter()
            .find(|o| o.id == mutex.id())
            .unwrap();
        assert_eq!(entry.owner, Some(thread.id()));
        assert!(entry.waiters.is_empty());
        assert!(snapshot.to_json().unwrap().contains("\"processes\""));
    }
}
