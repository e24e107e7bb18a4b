use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::value::BytesValue;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryPurpose {
    /// A regular user listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a Bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch the Bloom filter could not resolve.
    ExistenceFilterMismatchBloom,
    /// Single-document target resolving a limbo document.
    LimboResolution,
}

/// Everything the local store tracks about a target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: QueryPurpose,
    /// Listen sequence number of the last use, for LRU collection.
    pub sequence_number: i64,
    pub snapshot_version: SnapshotVersion,
    /// Snapshot version at which every document in the target's view was
    /// known to be synced (no limbo documents).
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: BytesValue,
    /// Documents the backend is expected to report on resume, checked
    /// against the next existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: QueryPurpose, sequence_number: i64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: BytesValue::empty(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: i64) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// A new token clears `expected_count`; it only describes the token it
    /// was captured with.
    pub fn with_resume_token(&self, resume_token: BytesValue, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
