//! Clock helpers for the two timelines the pipeline runs on: the monotonic
//! elapsed clock used for bucketing, and the wall clock used for periodic
//! alarms and persisted-state rebasing.

pub const NS_PER_SEC: i64 = 1_000_000_000;
pub const NS_PER_MS: i64 = 1_000_000;

/// Returns the current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        ts.tv_sec
            .saturating_mul(NS_PER_SEC)
            .saturating_add(ts.tv_nsec)
    } else {
        0
    }
}

/// Returns the current wall clock value in nanoseconds since the epoch.
pub fn wall_clock_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: same contract as `monotonic_ns`.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } == 0 {
        ts.tv_sec
            .saturating_mul(NS_PER_SEC)
            .saturating_add(ts.tv_nsec)
    } else {
        0
    }
}

/// Truncates a nanosecond timestamp to millisecond precision.
///
/// Forced bucket splits record boundaries at millisecond granularity so the
/// same boundary round-trips through a serialized report.
pub fn truncate_to_ms(ns: i64) -> i64 {
    ns / NS_PER_MS * NS_PER_MS
}

/// Converts nanoseconds to whole seconds, rounding toward zero.
pub fn ns_to_secs(ns: i64) -> i64 {
    ns / NS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_truncate_to_ms() {
        assert_eq!(truncate_to_ms(1_234_567_890), 1_234_000_000);
        assert_eq!(truncate_to_ms(999_999), 0);
        assert_eq!(truncate_to_ms(1_000_000), 1_000_000);
    }

    #[test]
    fn test_ns_to_secs() {
        assert_eq!(ns_to_secs(2_500_000_000), 2);
        assert_eq!(ns_to_secs(999_999_999), 0);
    }
}
