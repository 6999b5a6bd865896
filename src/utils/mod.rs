//! Utility types and functions used throughout the codebase.

pub mod sync;

use std::time::Duration;

/// Convert a guest timeout in nanoseconds to a host timeout.
///
/// Negative values mean "wait forever" and map to `None`.
pub fn timeout_from_nanos(ns: i64) -> Option<Duration> {
    u64::try_from(ns).ok().map(Duration::from_nanos)
}

/// Inverse of [`timeout_from_nanos`], saturating at `i64::MAX`.
pub fn nanos_from_timeout(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(t) => i64::try_from(t.as_nanos()).unwrap_or(i64::MAX),
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_timeout_is_infinite() {
        assert_eq!(timeout_from_nanos(-1), None);
        assert_eq!(timeout_from_nanos(0), Some(Duration::ZERO));
        assert_eq!(
            timeout_from_nanos(1_500_000),
            Some(Duration::from_micros(1500))
        );
        assert_eq!(nanos_from_timeout(None), -1);
        assert_eq!(nanos_from_timeout(Some(Duration::from_millis(2))), 2_000_000);
    }
}
