use std::collections::BTreeMap;

use crate::firestore::local::target_data::QueryPurpose;
use crate::firestore::model::{DocumentKeySet, MutableDocumentMap, SnapshotVersion};
use crate::firestore::value::BytesValue;

/// Aggregated result of one watch response cycle: everything the listen
/// stream reported up to a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose cached results must be discarded, keyed by the purpose
    /// the re-listen should carry.
    pub target_mismatches: BTreeMap<i32, QueryPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Documents that only limbo resolution targets reported.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event marking `target_id` current without any document change. Used
    /// when a target turns out to be current on the first snapshot.
    pub fn synthesized_for_current_change(target_id: i32, current: bool, resume_token: BytesValue) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target part of a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the cycle carried no new token.
    pub resume_token: BytesValue,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: BytesValue) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    /// Number of document changes carried.
    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
