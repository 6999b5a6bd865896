/// Abort the emulated session because scheduler bookkeeping is corrupt.
///
/// This is the InternalInvariantViolation class: a host-side programming error
/// (a thread found in two queues, a waiter missing from its own wait list, ...).
/// It is never reported to the guest.
#[macro_export]
macro_rules! invariant_violation {
    ($($format:tt)*) => {{
        let message = format!($($format)*);
        ::tracing::error!(target: "hle_kernel::invariant", "{}", message);
        panic!("kernel invariant violated: {}", message)
    }};
}

/// Write a free-form line to the scheduling tracer, formatting lazily.
#[macro_export]
macro_rules! kernel_msg {
    ($tracer:expr, $($format:tt)*) => {
        if $tracer.is_enabled() {
            $tracer.msg(format_args!($($format)*))
        }
    };
}
