use crate::utils::sync::{AtomicU64, Ordering};
use serde::Serialize;
use std::{fmt, time::Duration};

/// Scheduler counters.
///
/// All counters use `Ordering::Relaxed` because they are independent and do not
/// synchronize memory between threads. We only care that they are updated
/// atomically, not when those updates become visible relative to other memory
/// operations.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Number of times a core's front thread changed
    pub context_switches: AtomicU64,
    /// Number of asynchronous preemption requests sent to running threads
    pub preemption_requests: AtomicU64,
    /// Voluntary yields, including rotations on time-slice expiry
    pub yields: AtomicU64,
    pub time_slice_rotations: AtomicU64,
    /// Threads that blocked in a wait
    pub waits: AtomicU64,
    pub wakeups: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub wait_cancellations: AtomicU64,
    pub migrations: AtomicU64,
    pub priority_boosts: AtomicU64,
    /// Number of times a thread had to block waiting for a mutex
    pub lock_contention_count: AtomicU64,
    /// Total time spent waiting for mutexes (in microseconds)
    pub lock_contention_total_us: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_preemption_request(&self) {
        self.preemption_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_yield(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_time_slice_rotation(&self) {
        self.time_slice_rotations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wait_cancellation(&self) {
        self.wait_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_priority_boost(&self) {
        self.priority_boosts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            context_switches: load(&self.context_switches),
            preemption_requests: load(&self.preemption_requests),
            yields: load(&self.yields),
            time_slice_rotations: load(&self.time_slice_rotations),
            waits: load(&self.waits),
            wakeups: load(&self.wakeups),
            wait_timeouts: load(&self.wait_timeouts),
            wait_cancellations: load(&self.wait_cancellations),
            migrations: load(&self.migrations),
            priority_boosts: load(&self.priority_boosts),
            lock_contention_count: load(&self.lock_contention_count),
            lock_contention_total_us: load(&self.lock_contention_total_us),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub context_switches: u64,
    pub preemption_requests: u64,
    pub yields: u64,
    pub time_slice_rotations: u64,
    pub waits: u64,
    pub wakeups: u64,
    pub wait_timeouts: u64,
    pub wait_cancellations: u64,
    pub migrations: u64,
    pub priority_boosts: u64,
    pub lock_contention_count: u64,
    pub lock_contention_total_us: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scheduler Metrics:")?;
        writeln!(f, "  Context switches:     {:>10}", self.context_switches)?;
        writeln!(f, "  Preemption requests:  {:>10}", self.preemption_requests)?;
        writeln!(f, "  Yields:               {:>10}", self.yields)?;
        writeln!(f, "  Slice rotations:      {:>10}", self.time_slice_rotations)?;
        writeln!(f, "  Waits:                {:>10}", self.waits)?;
        writeln!(f, "  Wakeups:              {:>10}", self.wakeups)?;
        writeln!(f, "  Wait timeouts:        {:>10}", self.wait_timeouts)?;
        writeln!(f, "  Wait cancellations:   {:>10}", self.wait_cancellations)?;
        writeln!(f, "  Migrations:           {:>10}", self.migrations)?;
        writeln!(f, "  Priority boosts:      {:>10}", self.priority_boosts)?;
        writeln!(
            f,
            "  Lock contention:      {:>10} ({} us)",
            self.lock_contention_count, self.lock_contention_total_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SchedulerMetrics::new();
        metrics.record_context_switch();
        metrics.record_context_switch();
        metrics.record_lock_contention(Duration::from_micros(250));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.context_switches, 2);
        assert_eq!(snapshot.lock_contention_count, 1);
        assert_eq!(snapshot.lock_contention_total_us, 250);
        assert!(snapshot.to_string().contains("Context switches"));
    }
}
