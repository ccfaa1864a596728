//! Countdown arithmetic for the list timer backend.
//!
//! Countdowns are plain [`Duration`]s; subtraction clamps at zero, and a
//! zero countdown means the timer is due.

use std::time::Duration;

use nix::sys::time::TimeSpec;

/// Remaining time once `elapsed` has passed. Never goes negative.
pub(crate) fn advance(countdown: Duration, elapsed: Duration) -> Duration {
    countdown.saturating_sub(elapsed)
}

/// The `ppoll` timeout argument for a head-of-list countdown.
pub(crate) fn to_timespec(countdown: Duration) -> TimeSpec {
    TimeSpec::from_duration(countdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_clamps_at_zero() {
        let d = Duration::from_millis(50);
        assert_eq!(advance(d, Duration::from_millis(20)), Duration::from_millis(30));
        assert_eq!(advance(d, Duration::from_millis(50)), Duration::ZERO);
        assert_eq!(advance(d, Duration::from_millis(80)), Duration::ZERO);
    }

    #[test]
    fn timespec_carries_subsecond_part() {
        let ts = to_timespec(Duration::new(2, 250_000_000));
        assert_eq!(ts.tv_sec(), 2);
        assert_eq!(ts.tv_nsec(), 250_000_000);
    }
}
