use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Server logical time at which a document or target was last known.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    /// Largest representable version. Used as an upper bound in range scans.
    pub fn max() -> Self {
        Self {
            timestamp: Timestamp::new(253_402_300_799, 999_999_999),
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1000) as i32,
        ))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_is_smallest() {
        let v = SnapshotVersion::from_micros(1);
        assert!(SnapshotVersion::min() < v);
        assert!(SnapshotVersion::min().is_min());
        assert_eq!(v.to_micros(), 1);
        assert!(v < SnapshotVersion::max());
    }
}
