//! Canned guest programs exercising the scheduler end to end.
//!
//! Each scenario boots a single process whose main thread sets the stage
//! through supervisor calls, records the order in which guest threads reach
//! interesting points, and checks that order.
use crate::kernel::{
    types::{CoreId, CoreMask, ObjectKind, Priority},
    DeviceState, GuestContext, GuestResult, Handle, HostMemory, HostThreadEngine, KernelConfig,
    KernelError, KernelSnapshot, ThreadSpec,
};
use crate::utils::sync::{Arc, Mutex};
use clap::ValueEnum;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

const MAIN_ENTRY: u64 = 0x0800_0000;
const ENTRY_A: u64 = 0x0800_1000;
const ENTRY_B: u64 = 0x0800_2000;
const ENTRY_C: u64 = 0x0800_3000;

/// All guest threads run on this core so their ordering is decided by
/// priority alone.
const CORE: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// A holder sleeps with a mutex held; the contender gets it on release
    MutexHandoff,
    /// Three waiters on an empty semaphore, signaled twice
    Semaphore,
    /// A low-priority owner is boosted past a busy medium-priority thread
    PriorityInversion,
    /// Equal-priority threads rotate on time-slice expiry
    RoundRobin,
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub events: Vec<String>,
    pub expected: Vec<String>,
    pub passed: bool,
    pub snapshot: KernelSnapshot,
}

#[derive(Debug, Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn record(&self, event: impl Into<String>) {
        let event = event.into();
        info!("{}", event);
        self.0.lock().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

fn handle_arg(ctx: &GuestContext) -> Handle {
    Handle(ctx.argument() as u32)
}

pub fn run(scenario: Scenario, config: KernelConfig) -> Result<ScenarioReport, KernelError> {
    let engine = Arc::new(HostThreadEngine::new());
    let state = DeviceState::new(config, engine.clone(), Arc::new(HostMemory::new()));
    let log = EventLog::default();

    let (main_priority, expected) = match scenario {
        Scenario::MutexHandoff => mutex_handoff(&engine, &log),
        Scenario::Semaphore => semaphore(&engine, &log),
        Scenario::PriorityInversion => priority_inversion(&engine, &log),
        Scenario::RoundRobin => round_robin(&engine, &log, state.scheduler().time_slice()),
    };

    let process = state.create_process(&format!("{:?}", scenario));
    let main = state.create_thread(
        &process,
        ThreadSpec {
            entry: MAIN_ENTRY,
            argument: 0,
            stack_top: 0,
            priority: main_priority,
            ideal_core: Some(CoreId(0)),
            affinity: CoreMask::single(CoreId(0)),
        },
    )?;
    state.start_thread(&main)?;
    engine.join_all();

    let events = log.events();
    let passed = match scenario {
        // Only the relative order of the boosted owner's work matters.
        Scenario::PriorityInversion => {
            let at = |e: &str| events.iter().position(|x| x == e);
            matches!((at("H locked"), at("Med done")), (Some(h), Some(m)) if h < m)
        }
        _ => events == expected,
    };
    let snapshot = state.snapshot();
    state.shutdown();

    Ok(ScenarioReport {
        scenario,
        events,
        expected,
        passed,
        snapshot,
    })
}

fn strings(events: &[&str]) -> Vec<String> {
    events.iter().map(|e| e.to_string()).collect()
}

fn mutex_handoff(engine: &HostThreadEngine, log: &EventLog) -> (Priority, Vec<String>) {
    engine.register_entry(MAIN_ENTRY, |ctx| {
        let mutex = ctx.create_mutex()?;
        let arg = mutex.raw() as u64;
        let a = ctx.create_thread(ENTRY_A, arg, 0, 5, CORE)?;
        let b = ctx.create_thread(ENTRY_B, arg, 0, 10, CORE)?;
        ctx.start_thread(a)?;
        ctx.start_thread(b)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_A, move |ctx| {
        let mutex = handle_arg(ctx);
        ctx.arbitrate_lock(mutex)?;
        l.record("A acquired");
        ctx.sleep(100_000_000)?;
        l.record("A releasing");
        ctx.arbitrate_unlock(mutex)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_B, move |ctx| {
        let mutex = handle_arg(ctx);
        l.record("B waiting");
        ctx.arbitrate_lock(mutex)?;
        l.record("B acquired");
        ctx.arbitrate_unlock(mutex)
    });

    (
        44,
        strings(&["A acquired", "B waiting", "A releasing", "B acquired"]),
    )
}

fn semaphore(engine: &HostThreadEngine, log: &EventLog) -> (Priority, Vec<String>) {
    let l = log.clone();
    engine.register_entry(MAIN_ENTRY, move |ctx| {
        let semaphore = ctx.create_semaphore(0, 3)?;
        for priority in [30u32, 10, 20] {
            let arg = ((priority as u64) << 32) | semaphore.raw() as u64;
            let waiter = ctx.create_thread(ENTRY_A, arg, 0, priority, CORE)?;
            ctx.start_thread(waiter)?;
        }

        ctx.signal_semaphore(semaphore, 2)?;
        let still_waiting = ctx
            .state()
            .snapshot()
            .objects
            .iter()
            .filter(|o| o.kind == ObjectKind::Semaphore)
            .map(|o| o.waiters.len())
            .sum::<usize>();
        l.record(format!("{} still waiting", still_waiting));

        ctx.signal_semaphore(semaphore, 1).map(drop)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_A, move |ctx| {
        let semaphore = handle_arg(ctx);
        let priority = ctx.argument() >> 32;
        ctx.wait_for(&[semaphore], None)?;
        l.record(format!("waiter {} acquired", priority));
        Ok(())
    });

    (
        44,
        strings(&[
            "waiter 10 acquired",
            "waiter 20 acquired",
            "1 still waiting",
            "waiter 30 acquired",
        ]),
    )
}

fn priority_inversion(engine: &HostThreadEngine, log: &EventLog) -> (Priority, Vec<String>) {
    engine.register_entry(MAIN_ENTRY, |ctx| {
        let mutex = ctx.create_mutex()?;
        let arg = mutex.raw() as u64;
        let low = ctx.create_thread(ENTRY_A, arg, 0, 40, CORE)?;
        let high = ctx.create_thread(ENTRY_B, arg, 0, 5, CORE)?;
        let medium = ctx.create_thread(ENTRY_C, 0, 0, 20, CORE)?;
        ctx.start_thread(low)?;
        ctx.start_thread(high)?;
        ctx.start_thread(medium)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_A, move |ctx| {
        let mutex = handle_arg(ctx);
        ctx.arbitrate_lock(mutex)?;
        l.record("L locked");
        ctx.sleep(30_000_000)?;
        l.record("L unlocking");
        ctx.arbitrate_unlock(mutex)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_B, move |ctx| {
        let mutex = handle_arg(ctx);
        l.record("H waiting");
        ctx.arbitrate_lock(mutex)?;
        l.record("H locked");
        ctx.arbitrate_unlock(mutex)
    });

    let l = log.clone();
    engine.register_entry(ENTRY_C, move |ctx| {
        for _ in 0..40 {
            std::thread::sleep(Duration::from_millis(5));
            ctx.safe_point()?;
        }
        l.record("Med done");
        Ok(())
    });

    (
        50,
        strings(&["L locked", "H waiting", "L unlocking", "H locked", "Med done"]),
    )
}

fn round_robin(
    engine: &HostThreadEngine,
    log: &EventLog,
    time_slice: Duration,
) -> (Priority, Vec<String>) {
    const WORKERS: u64 = 3;
    const STEPS: u64 = 3;

    engine.register_entry(MAIN_ENTRY, |ctx| {
        for index in 1..=WORKERS {
            let worker = ctx.create_thread(ENTRY_A, index, 0, 30, CORE)?;
            ctx.start_thread(worker)?;
        }
        Ok(())
    });

    let l = log.clone();
    engine.register_entry(ENTRY_A, move |ctx: &GuestContext| -> GuestResult<()> {
        for step in 0..STEPS {
            l.record(format!("T{} step {}", ctx.argument(), step));
            std::thread::sleep(time_slice * 2);
            ctx.safe_point()?;
        }
        Ok(())
    });

    let expected = (0..STEPS)
        .flat_map(|step| (1..=WORKERS).map(move |w| format!("T{} step {}", w, step)))
        .collect();
    (20, expected)
}
