//! Randomized contention runs. Each seed fixes priorities, cores and pauses;
//! the checks are mutual exclusion under the guest mutex and that no
//! semaphore wakeup is lost.
use hle_kernel::kernel::{
    CoreId, CoreMask, DeviceState, Handle, HostMemory, HostThreadEngine, KernelConfig,
    ThreadSpec, WaitOutcome,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const MAIN: u64 = 0x0900_0000;
const WORKER: u64 = 0x0900_1000;
const CONSUMER: u64 = 0x0900_2000;

const SEEDS: [u64; 3] = [0x5EED, 0xC0FFEE, 0x1234_5678_9ABC];

struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn session(cores: usize) -> (Arc<HostThreadEngine>, Arc<DeviceState>) {
    let engine = Arc::new(HostThreadEngine::new());
    let config = KernelConfig::default()
        .with_core_count(cores)
        .with_time_slice(Duration::from_millis(1));
    let state = DeviceState::new(config, engine.clone(), Arc::new(HostMemory::new()));
    (engine, state)
}

fn boot(engine: &HostThreadEngine, state: &Arc<DeviceState>) {
    let process = state.create_process("stress");
    let main = state
        .create_thread(
            &process,
            ThreadSpec {
                entry: MAIN,
                argument: 0,
                stack_top: 0,
                priority: 50,
                ideal_core: Some(CoreId(0)),
                affinity: CoreMask::single(CoreId(0)),
            },
        )
        .unwrap();
    state.start_thread(&main).unwrap();
    engine.join_all();
    assert!(process.exit_signal().is_signaled());
}

#[test]
fn test_mutex_keeps_mutual_exclusion() {
    const WORKERS: u64 = 6;
    const ROUNDS: usize = 25;

    for seed in SEEDS {
        let (engine, state) = session(2);
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        engine.register_entry(MAIN, move |ctx| {
            let mut rng = SplitMix64(seed);
            let mutex = ctx.create_mutex()?;
            for _ in 0..WORKERS {
                let priority = 20 + rng.below(20) as u32;
                let core = rng.below(2) as i32;
                let arg = (rng.next() << 32) | mutex.raw() as u64;
                let worker = ctx.create_thread(WORKER, arg, 0, priority, core)?;
                ctx.start_thread(worker)?;
            }
            Ok(())
        });

        let (i, v, t) = (inside.clone(), violations.clone(), total.clone());
        engine.register_entry(WORKER, move |ctx| {
            let mutex = Handle(ctx.argument() as u32);
            let mut rng = SplitMix64(ctx.argument() >> 32);
            for _ in 0..ROUNDS {
                ctx.arbitrate_lock(mutex)?;
                if i.fetch_add(1, Ordering::SeqCst) != 0 {
                    v.fetch_add(1, Ordering::SeqCst);
                }
                if rng.below(3) == 0 {
                    ctx.yield_now()?;
                }
                t.fetch_add(1, Ordering::SeqCst);
                i.fetch_sub(1, Ordering::SeqCst);
                ctx.arbitrate_unlock(mutex)?;
                ctx.sleep(rng.below(200_000) as i64)?;
            }
            Ok(())
        });

        boot(&engine, &state);
        assert_eq!(violations.load(Ordering::SeqCst), 0, "seed {:#x}", seed);
        assert_eq!(
            total.load(Ordering::SeqCst),
            WORKERS as usize * ROUNDS,
            "seed {:#x}",
            seed
        );
        state.shutdown();
    }
}

#[test]
fn test_semaphore_loses_no_wakeups() {
    const PRODUCERS: u64 = 3;
    const CONSUMERS: u64 = 4;
    const PER_PRODUCER: u64 = 12;
    const ITEMS: u64 = PRODUCERS * PER_PRODUCER;

    for seed in SEEDS {
        let (engine, state) = session(3);
        let consumed = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));

        engine.register_entry(MAIN, move |ctx| {
            let mut rng = SplitMix64(seed);
            let semaphore = ctx.create_semaphore(0, ITEMS as u32)?;
            let base = semaphore.raw() as u64;
            for index in 0..CONSUMERS {
                // Share the items out so every consumer has a fixed quota.
                let quota = ITEMS / CONSUMERS + u64::from(index < ITEMS % CONSUMERS);
                let arg = (quota << 48) | ((rng.next() & 0xFFFF) << 32) | base;
                let priority = 10 + rng.below(30) as u32;
                let consumer = ctx.create_thread(CONSUMER, arg, 0, priority, -1)?;
                ctx.start_thread(consumer)?;
            }
            for _ in 0..PRODUCERS {
                let arg = ((rng.next() & 0xFFFF) << 32) | base;
                let priority = 10 + rng.below(30) as u32;
                let producer = ctx.create_thread(WORKER, arg, 0, priority, -1)?;
                ctx.start_thread(producer)?;
            }
            Ok(())
        });

        engine.register_entry(WORKER, move |ctx| {
            let semaphore = Handle(ctx.argument() as u32);
            let mut rng = SplitMix64(ctx.argument() >> 32);
            for _ in 0..PER_PRODUCER {
                ctx.sleep(1 + rng.below(300_000) as i64)?;
                ctx.signal_semaphore(semaphore, 1)?;
            }
            Ok(())
        });

        let (c, t) = (consumed.clone(), timed_out.clone());
        engine.register_entry(CONSUMER, move |ctx| {
            let semaphore = Handle(ctx.argument() as u32);
            let quota = ctx.argument() >> 48;
            for _ in 0..quota {
                match ctx.wait_synchronization(&[semaphore], 5_000_000_000)? {
                    WaitOutcome::Signaled { .. } => c.fetch_add(1, Ordering::SeqCst),
                    WaitOutcome::TimedOut => t.fetch_add(1, Ordering::SeqCst),
                };
            }
            Ok(())
        });

        boot(&engine, &state);
        assert_eq!(timed_out.load(Ordering::SeqCst), 0, "seed {:#x}", seed);
        assert_eq!(consumed.load(Ordering::SeqCst), ITEMS as usize, "seed {:#x}", seed);
        state.shutdown();
    }
}
