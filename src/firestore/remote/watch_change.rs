use crate::firestore::error::FirestoreError;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::value::BytesValue;

/// Server-side state transition reported for one or more targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Affected targets. Empty means "every active target".
    pub target_ids: Vec<i32>,
    pub resume_token: BytesValue,
    /// Set when the backend removed the targets because of an error.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: BytesValue::empty(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: BytesValue) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered, changed in, or left a set of targets.
///
/// `new_document` is `None` when the document only left the targets without
/// the backend saying anything about its contents.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub new_document: Option<MutableDocument>,
}

impl DocumentWatchChange {
    /// The backend sent new contents for `document`.
    pub fn updated(document: MutableDocument, updated_target_ids: Vec<i32>, removed_target_ids: Vec<i32>) -> Self {
        Self {
            updated_target_ids,
            removed_target_ids,
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    /// The document was deleted as of `read_time`.
    pub fn deleted(key: DocumentKey, read_time: SnapshotVersion, removed_target_ids: Vec<i32>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids,
            new_document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
            key,
        }
    }

    /// The document no longer matches the targets.
    pub fn removed(key: DocumentKey, removed_target_ids: Vec<i32>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids,
            key,
            new_document: None,
        }
    }
}

/// Bloom filter payload of an existence filter, before validation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilter {
    /// Number of documents the backend holds for the target.
    pub count: i32,
    /// Names of the documents that did not change since the resume token.
    pub unchanged_names: Option<BloomFilterPayload>,
}

impl ExistenceFilter {
    pub fn new(count: i32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }

    pub fn with_bloom_filter(count: i32, unchanged_names: BloomFilterPayload) -> Self {
        Self {
            count,
            unchanged_names: Some(unchanged_names),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub existence_filter: ExistenceFilter,
}

/// A decoded message of the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletes_carry_a_tombstone() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let change = DocumentWatchChange::deleted(key.clone(), SnapshotVersion::from_micros(5), vec![2]);
        let tombstone = change.new_document.expect("tombstone");
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), SnapshotVersion::from_micros(5));

        let removal = DocumentWatchChange::removed(key, vec![2]);
        assert!(removal.new_document.is_none());
    }
}
