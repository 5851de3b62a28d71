//! Conversions between frequency, nanoseconds, microseconds and a
//! (seconds, nanoseconds) pair. See spec.md §4.1.

use std::ops::{Add, Sub};
use std::time::SystemTime;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A wall-clock duration/timestamp expressed as (seconds, nanoseconds),
/// the same shape as `libc::timespec` but signed and arithmetic-friendly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    pub fn new(sec: i64, nsec: i64) -> TimeSpec {
        normalize(sec, nsec)
    }

    /// Current `CLOCK_REALTIME` reading, matching `clock_gettime` in the
    /// original sampler.
    pub fn now() -> TimeSpec {
        let d = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        TimeSpec {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }

    pub fn from_frequency(hz: f64) -> TimeSpec {
        if hz == 0.0 {
            return TimeSpec::ZERO;
        }
        let sec = (1.0 / hz).floor() as i64;
        let nsec = ((1_000_000_000.0 / hz) as i64).rem_euclid(NSEC_PER_SEC);
        TimeSpec { sec, nsec }
    }

    pub fn from_nanoseconds(n: u64) -> TimeSpec {
        TimeSpec {
            sec: (n / NSEC_PER_SEC as u64) as i64,
            nsec: (n % NSEC_PER_SEC as u64) as i64,
        }
    }

    pub fn from_microseconds(n: u64) -> TimeSpec {
        TimeSpec::from_nanoseconds(n.saturating_mul(1_000))
    }

    pub fn from_milliseconds(n: u64) -> TimeSpec {
        TimeSpec::from_nanoseconds(n.saturating_mul(1_000_000))
    }

    pub fn from_seconds(n: u64) -> TimeSpec {
        TimeSpec {
            sec: n as i64,
            nsec: 0,
        }
    }

    /// Truncating conversion to nanoseconds. Negative values clamp to zero,
    /// matching `timespecToNanoseconds` in the original sampler.
    pub fn to_nanoseconds(self) -> u64 {
        if self.sec < 0 || (self.sec == 0 && self.nsec < 0) {
            return 0;
        }
        (self.sec as u64) * (NSEC_PER_SEC as u64) + self.nsec as u64
    }

    pub fn to_microseconds(self) -> u64 {
        self.to_nanoseconds() / 1_000
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

fn normalize(sec: i64, nsec: i64) -> TimeSpec {
    let mut sec = sec;
    let mut nsec = nsec;
    if nsec >= NSEC_PER_SEC {
        sec += nsec / NSEC_PER_SEC;
        nsec %= NSEC_PER_SEC;
    } else if nsec < 0 {
        let borrow = (-nsec + NSEC_PER_SEC - 1) / NSEC_PER_SEC;
        sec -= borrow;
        nsec += borrow * NSEC_PER_SEC;
    }
    TimeSpec { sec, nsec }
}

impl Add for TimeSpec {
    type Output = TimeSpec;
    fn add(self, rhs: TimeSpec) -> TimeSpec {
        normalize(self.sec + rhs.sec, self.nsec + rhs.nsec)
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;
    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        normalize(self.sec - rhs.sec, self.nsec - rhs.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frequency_zero_disables_timer() {
        assert_eq!(TimeSpec::from_frequency(0.0), TimeSpec::ZERO);
    }

    #[test]
    fn frequency_round_trip_within_tolerance() {
        for hz in [1.0, 10.0, 100.0, 1000.0, 4321.0] {
            let interval = TimeSpec::from_frequency(hz);
            let secs = interval.to_nanoseconds() as f64 / 1e9;
            let actual_hz = 1.0 / secs;
            assert!((actual_hz - hz).abs() / hz < 1e-6, "hz={}", hz);
        }
    }

    #[test]
    fn add_carries_across_one_second() {
        let a = TimeSpec::new(0, 900_000_000);
        let b = TimeSpec::new(0, 200_000_000);
        assert_eq!(a + b, TimeSpec::new(1, 100_000_000));
    }

    #[test]
    fn sub_borrows_across_one_second() {
        let a = TimeSpec::new(1, 100_000_000);
        let b = TimeSpec::new(0, 200_000_000);
        assert_eq!(a - b, TimeSpec::new(0, 900_000_000));
    }

    #[test]
    fn sub_then_add_reproduces_original() {
        let a = TimeSpec::new(5, 250_000_000);
        let b = TimeSpec::new(2, 750_000_000);
        assert_eq!((a - b) + b, a);
    }

    #[test]
    fn negative_duration_clamps_to_zero_nanoseconds() {
        let a = TimeSpec::new(0, 100);
        let b = TimeSpec::new(5, 0);
        let negative = a - b;
        assert_eq!(negative.to_nanoseconds(), 0);
    }

    #[test]
    fn microseconds_truncate_not_round() {
        let t = TimeSpec::new(0, 1_999);
        assert_eq!(t.to_microseconds(), 1);
    }

    #[test]
    fn ordering_follows_normalized_fields() {
        let earlier = TimeSpec::new(1, 500_000_000);
        let later = TimeSpec::new(1, 900_000_000);
        assert!(earlier < later);
        assert!(TimeSpec::new(2, 0) > later);
    }
}
