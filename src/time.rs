//! Time source: monotonic nanosecond clock, wall clock and precise sleep.
//!
//! All arrival-time arithmetic uses clock nanoseconds; only wall time
//! crosses the boundary to humans. Sleeping is gated by a minimum-sleep
//! floor: the OS cannot honour very short sleeps precisely, so a request
//! below the floor returns immediately and the caller runs early instead
//! of waking late.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Nanosecond timestamps and durations.
pub type TimeNs = i64;

pub const T_US: TimeNs = 1_000;
pub const T_MS: TimeNs = 1_000_000;
pub const T_SEC: TimeNs = 1_000_000_000;

/// Sentinel for "no timestamp yet" / "no limit".
pub const TIME_MAX: TimeNs = TimeNs::MAX;

/// Default floor below which `sleep_nanos` returns immediately.
pub const DEFAULT_MIN_SLEEP: TimeNs = 50 * T_US;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *CLOCK_EPOCH.get_or_init(Instant::now)
}

/// Monotonic clock, nanoseconds since the first call in this process.
pub fn now_clock() -> TimeNs {
    epoch().elapsed().as_nanos() as TimeNs
}

/// Wall clock, nanoseconds since the UNIX epoch.
pub fn now_wall() -> TimeNs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as TimeNs)
        .unwrap_or(0)
}

/// Sleep for `duration` nanoseconds, honouring the `min_sleep` floor.
///
/// Durations at or below the floor (or negative) return immediately.
pub fn sleep_nanos(duration: TimeNs, min_sleep: TimeNs) {
    if duration <= min_sleep {
        return;
    }
    std::thread::sleep(Duration::from_nanos(duration as u64));
}

/// Sleep until the monotonic clock reaches `deadline`.
pub fn sleep_until(deadline: TimeNs, min_sleep: TimeNs) {
    let remaining = deadline - now_clock();
    sleep_nanos(remaining, min_sleep);
}

/// Smallest observable tick of the monotonic clock.
///
/// Probed by sampling until the reading changes; bounded so a coarse
/// clock cannot stall the caller.
pub fn clock_resolution() -> TimeNs {
    let start = now_clock();
    for _ in 0..1_000_000 {
        let now = now_clock();
        if now != start {
            return now - start;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let mut prev = now_clock();
        for _ in 0..1000 {
            let now = now_clock();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_sleep_below_floor_returns_immediately() {
        let before = now_clock();
        sleep_nanos(10 * T_US, DEFAULT_MIN_SLEEP);
        let elapsed = now_clock() - before;
        // No sleep syscall should have happened; allow generous scheduler slack.
        assert!(elapsed < 10 * T_MS, "elapsed {elapsed}ns");
    }

    #[test]
    fn test_sleep_above_floor_sleeps() {
        let before = now_clock();
        sleep_nanos(5 * T_MS, DEFAULT_MIN_SLEEP);
        let elapsed = now_clock() - before;
        assert!(elapsed >= 4 * T_MS, "elapsed {elapsed}ns");
    }

    #[test]
    fn test_resolution_is_positive() {
        assert!(clock_resolution() > 0);
    }

    #[test]
    fn test_wall_clock_is_plausible() {
        // Sometime after 2020-01-01.
        assert!(now_wall() > 1_577_836_800 * T_SEC);
    }
}
