//! Buffered scheduling-event tracer.
//!
//! This is separate from the `tracing` diagnostics: it records a line per
//! scheduling decision so that an ordering problem in a guest can be replayed
//! after the fact without turning on verbose logging for the whole crate.
//!
//! ## Environment Variables
//!
//! - `HLE_KERNEL_TRACE`: Enable tracing
//!   - `"1"`, `"true"`, or `"stdout"`: Write to stdout
//!   - `"stderr"`: Write to stderr
//!   - `<path>`: Write to file at path
//!
//! - `HLE_KERNEL_TRACE_FLUSH_INTERVAL`: Number of messages before auto-flush (default: 10000)
//!
//! - `HLE_KERNEL_TRACE_STATS`: Enable per-category statistics (`"1"` or `"true"`),
//!   printed to stderr when the tracer is dropped
//!
//! Every line is prefixed with the guest thread the calling host thread is
//! running (or the host thread's name outside guest code), so interleavings
//! on different cores can be told apart.
use crate::utils::sync::{current_guest_thread, AtomicBool, Mutex, Ordering};
use std::{
    env,
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
    thread,
};

use super::types::{CoreId, Priority, ProcessId, ThreadId};

const BUFFER_SIZE: usize = 64 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000;

/// Statistics for scheduling-event tracing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub total_messages: usize,
    pub thread_events: usize,
    pub switches: usize,
    pub preemptions: usize,
    pub waits: usize,
    pub wakes: usize,
    pub priority_changes: usize,
    pub migrations: usize,
}

struct TraceOutput {
    writer: BufWriter<Box<dyn Write + Send>>,
    message_count: usize,
}

pub struct Tracer {
    enabled: AtomicBool,
    output: Mutex<Option<TraceOutput>>,
    auto_flush_interval: usize,
    stats: Mutex<TraceStats>,
    detailed_stats: bool,
}

impl Tracer {
    pub fn new() -> Self {
        let writer: Option<Box<dyn Write + Send>> = match env::var("HLE_KERNEL_TRACE") {
            Ok(val) if val == "1" || val == "true" || val == "stdout" => Some(Box::new(stdout())),
            Ok(val) if val == "stderr" => Some(Box::new(stderr())),
            Ok(val) if !val.is_empty() => match File::create(&val) {
                Ok(f) => Some(Box::new(f)),
                Err(e) => {
                    tracing::warn!("failed to create trace file {}: {}", val, e);
                    None
                }
            },
            _ => None,
        };

        let auto_flush_interval = env::var("HLE_KERNEL_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(AUTO_FLUSH_INTERVAL);

        let detailed_stats = env::var("HLE_KERNEL_TRACE_STATS")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        Self::build(writer, auto_flush_interval, detailed_stats)
    }

    /// A tracer that records nothing.
    pub fn disabled() -> Self {
        Self::build(None, AUTO_FLUSH_INTERVAL, false)
    }

    /// A tracer writing to an arbitrary sink, with statistics enabled.
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self::build(Some(writer), AUTO_FLUSH_INTERVAL, true)
    }

    fn build(
        writer: Option<Box<dyn Write + Send>>,
        auto_flush_interval: usize,
        detailed_stats: bool,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(writer.is_some()),
            output: Mutex::new(writer.map(|w| TraceOutput {
                writer: BufWriter::with_capacity(BUFFER_SIZE, w),
                message_count: 0,
            })),
            auto_flush_interval: auto_flush_interval.max(1),
            stats: Mutex::new(TraceStats::default()),
            detailed_stats,
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn write_msg(&self, args: std::fmt::Arguments) {
        let origin = match current_guest_thread() {
            Some(id) => format!("T{}", id),
            None => thread::current().name().unwrap_or("unnamed").to_string(),
        };
        let mut output = self.output.lock();
        if let Some(out) = output.as_mut() {
            let _ = writeln!(out.writer, "[{}] {}", origin, args);
            out.message_count += 1;
            if out.message_count >= self.auto_flush_interval {
                let _ = out.writer.flush();
                out.message_count = 0;
            }
        }
    }

    fn record(&self, bump: impl FnOnce(&mut TraceStats)) {
        if self.detailed_stats {
            let mut stats = self.stats.lock();
            stats.total_messages += 1;
            bump(&mut stats);
        }
    }

    pub fn msg(&self, args: std::fmt::Arguments) {
        if !self.is_enabled() {
            return;
        }
        self.record(|_| {});
        self.write_msg(args);
    }

    pub fn flush(&self) {
        if let Some(out) = self.output.lock().as_mut() {
            let _ = out.writer.flush();
            out.message_count = 0;
        }
    }

    pub fn trace_thread_create(&self, thread: ThreadId, process: ProcessId, priority: Priority) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.thread_events += 1);
        self.write_msg(format_args!(
            "+ THREAD {} in {} prio {}",
            thread, process, priority
        ));
    }

    pub fn trace_thread_start(&self, thread: ThreadId, core: CoreId) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.thread_events += 1);
        self.write_msg(format_args!("▶ START  {} on {}", thread, core));
    }

    pub fn trace_thread_exit(&self, thread: ThreadId) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.thread_events += 1);
        self.write_msg(format_args!("- THREAD {}", thread));
    }

    pub fn trace_switch(&self, core: CoreId, from: Option<ThreadId>, to: Option<ThreadId>) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.switches += 1);
        let fmt = |t: Option<ThreadId>| t.map_or_else(|| "idle".to_string(), |t| t.to_string());
        self.write_msg(format_args!("⇄ SWITCH {} {} -> {}", core, fmt(from), fmt(to)));
    }

    pub fn trace_preempt(&self, core: CoreId, victim: ThreadId, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.preemptions += 1);
        self.write_msg(format_args!("⚡ PREEMPT {} on {} ({})", victim, core, reason));
    }

    pub fn trace_wait(&self, thread: ThreadId, objects: usize, timeout: Option<std::time::Duration>) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.waits += 1);
        match timeout {
            Some(t) => self.write_msg(format_args!(
                "⏸ WAIT   {} on {} object(s), timeout {:?}",
                thread, objects, t
            )),
            None => self.write_msg(format_args!(
                "⏸ WAIT   {} on {} object(s)",
                thread, objects
            )),
        }
    }

    pub fn trace_wake(&self, thread: ThreadId, cause: &str) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.wakes += 1);
        self.write_msg(format_args!("⏵ WAKE   {} ({})", thread, cause));
    }

    pub fn trace_priority(&self, thread: ThreadId, from: Priority, to: Priority, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.priority_changes += 1);
        self.write_msg(format_args!(
            "↕ PRIO   {} {} -> {} ({})",
            thread, from, to, reason
        ));
    }

    pub fn trace_migration(&self, thread: ThreadId, from: CoreId, to: CoreId) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.migrations += 1);
        self.write_msg(format_args!("→ MIGRATE {} {} -> {}", thread, from, to));
    }

    pub fn trace_process_exit(&self, process: ProcessId) {
        if !self.is_enabled() {
            return;
        }
        self.record(|s| s.thread_events += 1);
        self.write_msg(format_args!("✖ PROCESS {} exited", process));
    }

    pub fn stats(&self) -> TraceStats {
        self.stats.lock().clone()
    }

    pub fn print_stats(&self) {
        if !self.detailed_stats {
            return;
        }
        let stats = self.stats.lock();
        eprintln!("\n=== Scheduler Trace Statistics ===");
        eprintln!("Total messages:    {:>12}", stats.total_messages);
        eprintln!("Thread events:     {:>12}", stats.thread_events);
        eprintln!("Switches:          {:>12}", stats.switches);
        eprintln!("Preemptions:       {:>12}", stats.preemptions);
        eprintln!("Waits:             {:>12}", stats.waits);
        eprintln!("Wakes:             {:>12}", stats.wakes);
        eprintln!("Priority changes:  {:>12}", stats.priority_changes);
        eprintln!("Migrations:        {:>12}", stats.migrations);
        eprintln!("==================================\n");
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.detailed_stats && self.is_enabled() {
            self.print_stats();
        }
        self.flush();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_disabled_tracer_records_nothing() {
        let tracer = Tracer::disabled();
        assert!(!tracer.is_enabled());
        tracer.trace_thread_exit(ThreadId(1));
        assert_eq!(tracer.stats(), TraceStats::default());
    }

    #[test]
    fn test_events_reach_the_writer() {
        let buf = SharedBuf::default();
        let tracer = Tracer::with_writer(Box::new(buf.clone()));
        tracer.trace_switch(CoreId(1), None, Some(ThreadId(9)));
        tracer.trace_wake(ThreadId(9), "signaled");
        tracer.flush();

        crate::utils::sync::set_current_guest_thread(Some(4));
        tracer.trace_thread_exit(ThreadId(4));
        crate::utils::sync::set_current_guest_thread(None);
        tracer.flush();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert!(text.contains("SWITCH core1 idle -> T9"), "{text}");
        assert!(text.lines().last().unwrap().starts_with("[T4] "), "{text}");
        assert!(text.contains("WAKE   T9 (signaled)"), "{text}");

        let stats = tracer.stats();
        assert_eq!(stats.switches, 1);
        assert_eq!(stats.wakes, 1);
        assert_eq!(stats.thread_events, 1);
        assert_eq!(stats.total_messages, 3);
    }
}
