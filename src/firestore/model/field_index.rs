use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::constants::BATCH_ID_UNKNOWN;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache up to which an index has been
/// populated. Documents order by read time, then key, then batch id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    /// `None` sorts before every real key.
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn new(
        read_time: SnapshotVersion,
        document_key: Option<DocumentKey>,
        largest_batch_id: i32,
    ) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), None, BATCH_ID_UNKNOWN)
    }

    /// Offset sorting after every document read at `read_time`.
    pub fn create_successor(read_time: SnapshotVersion, largest_batch_id: i32) -> Self {
        let ts = read_time.timestamp();
        let successor = if ts.nanos == 999_999_999 {
            Timestamp::new(ts.seconds + 1, 0)
        } else {
            Timestamp::new(ts.seconds, ts.nanos + 1)
        };
        Self::new(SnapshotVersion::new(successor), None, largest_batch_id)
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self::new(
            document.read_time(),
            Some(document.key().clone()),
            BATCH_ID_UNKNOWN,
        )
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

/// Backfill progress of a field index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            offset: IndexOffset::none(),
        }
    }
}

/// A client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub state: IndexState,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: -1,
            collection_group: collection_group.into(),
            segments,
            state: IndexState::default(),
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Two indexes are interchangeable when they cover the same collection
    /// group with the same segments, regardless of id and state.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}
