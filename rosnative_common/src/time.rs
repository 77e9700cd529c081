use std::ops::{Add, Sub};

/// Matches the integral ros1 time type, with extensions for ease of use.
///
/// The zero value is the unix epoch, which doubles as the "uninitialized"
/// simulated-clock value.
#[derive(
    :: serde :: Deserialize,
    :: serde :: Serialize,
    Debug,
    Default,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
)]
pub struct Time {
    pub secs: u32,
    pub nsecs: u32,
}

impl Time {
    pub const fn new(secs: u32, nsecs: u32) -> Self {
        Time { secs, nsecs }
    }

    pub fn seconds(&self) -> f64 {
        f64::from(self.secs) + f64::from(self.nsecs) / 1e9
    }
}

impl From<std::time::SystemTime> for Time {
    fn from(val: std::time::SystemTime) -> Self {
        let delta = val
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Time {
            // Saturates in 2106, acceptable for a wire format that is u32 anyway
            secs: u32::try_from(delta.as_secs()).unwrap_or(u32::MAX),
            nsecs: delta.subsec_nanos(),
        }
    }
}

/// Matches the integral ros1 duration type.
#[derive(
    :: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, Copy, Eq, PartialEq,
)]
pub struct Duration {
    pub sec: i32,
    pub nsec: i32,
}

impl Duration {
    pub const fn new(sec: i32, nsec: i32) -> Self {
        Duration { sec, nsec }
    }

    pub const fn from_secs(sec: i32) -> Self {
        Duration { sec, nsec: 0 }
    }
}

impl From<std::time::Duration> for Duration {
    fn from(val: std::time::Duration) -> Self {
        Duration {
            sec: i32::try_from(val.as_secs()).unwrap_or(i32::MAX),
            nsec: val.subsec_nanos() as i32,
        }
    }
}

impl From<Duration> for std::time::Duration {
    /// Negative durations clamp to zero.
    fn from(val: Duration) -> Self {
        let nanos = i64::from(val.sec) * 1_000_000_000 + i64::from(val.nsec);
        if nanos <= 0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_nanos(nanos as u64)
        }
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        let nsec_sum = i64::from(self.nsecs) + i64::from(rhs.nsec);
        let secs = i64::from(self.secs) + i64::from(rhs.sec) + nsec_sum.div_euclid(1_000_000_000);
        let nsecs = nsec_sum.rem_euclid(1_000_000_000);
        if secs < 0 {
            return Time { secs: 0, nsecs: 0 };
        }
        Time {
            secs: secs as u32,
            nsecs: nsecs as u32,
        }
    }
}

impl Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        let nsec_diff = i64::from(self.nsecs) - i64::from(rhs.nsecs);
        let secs = i64::from(self.secs) - i64::from(rhs.secs) + nsec_diff.div_euclid(1_000_000_000);
        let nsecs = nsec_diff.rem_euclid(1_000_000_000);
        Duration {
            sec: secs as i32,
            nsec: nsecs as i32,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_carries_nanoseconds() {
        let t = Time::new(1, 900_000_000) + Duration::new(0, 200_000_000);
        assert_eq!(t, Time::new(2, 100_000_000));
    }

    #[test]
    fn sub_borrows_nanoseconds() {
        let d = Time::new(2, 100_000_000) - Time::new(1, 900_000_000);
        assert_eq!(d, Duration::new(0, 200_000_000));
        // Round-trips through add
        assert_eq!(Time::new(1, 900_000_000) + d, Time::new(2, 100_000_000));
    }

    #[test]
    fn negative_duration_clamps_to_zero_std() {
        let d = Time::new(1, 0) - Time::new(5, 0);
        assert_eq!(std::time::Duration::from(d), std::time::Duration::ZERO);
    }

    #[test]
    fn ordering_is_lexicographic_on_secs_then_nsecs() {
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert!(Time::new(2, 1) > Time::new(2, 0));
        assert!(Time::new(2, 0) <= Time::new(2, 0));
    }
}
