use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1000), (millis.rem_euclid(1000) * 1_000_000) as i32)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self {
                seconds: duration.as_secs() as i64,
                nanos: duration.subsec_nanos() as i32,
            },
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1000 + i64::from(self.nanos / 1_000_000)
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1000)
    }

    /// Elapsed wall-clock time between two timestamps, saturating at zero.
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        let micros = self.to_micros() - earlier.to_micros();
        Duration::from_micros(micros.max(0) as u64)
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);
        let negative = Timestamp::new(1, -1);
        assert_eq!(negative.seconds, 0);
        assert_eq!(negative.nanos, 999_999_999);
    }

    #[test]
    fn ordering() {
        let earlier = Timestamp::new(1, 0);
        let later = Timestamp::new(2, 0);
        assert!(earlier < later);
        assert_eq!(later.duration_since(&earlier), Duration::from_secs(1));
        assert_eq!(earlier.duration_since(&later), Duration::ZERO);
    }

    #[test]
    fn millis_conversion() {
        let ts = Timestamp::from_millis(1_500);
        assert_eq!(ts, Timestamp::new(1, 500_000_000));
        assert_eq!(ts.to_millis(), 1_500);
    }
}
