use std::collections::BTreeMap;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument};
use crate::util::assert::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Removals are reported first, then additions, then modifications.
    pub(crate) fn order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: MutableDocument) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates per-document changes, folding successive changes to the same
/// document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => fail(format!(
                "unsupported document change combination {old_type:?} then {new_type:?} for {key}"
            )),
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Whether a view is backed by the backend's current result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    None,
    Local,
    Synced,
}

/// One observable state of a query's results, with the changes since the
/// previous state.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    /// Keys with local writes not yet acknowledged.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The target had results from a previous session.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// First snapshot a listener sees: every document is an addition.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        let old_documents = DocumentSet::new(documents.comparator().clone());
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::empty(),
        )
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(ChangeType::Added, doc("rooms/a", 1)));
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("rooms/a", 1)));
        assert!(set.is_empty());
    }

    #[test]
    fn folds_successive_changes() {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(ChangeType::Added, doc("rooms/a", 1)));
        set.track(DocumentViewChange::new(ChangeType::Modified, doc("rooms/a", 2)));
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("rooms/b", 1)));
        set.track(DocumentViewChange::new(ChangeType::Added, doc("rooms/b", 3)));
        set.track(DocumentViewChange::new(ChangeType::Metadata, doc("rooms/c", 1)));
        set.track(DocumentViewChange::new(ChangeType::Modified, doc("rooms/c", 4)));

        let changes = set.changes();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].document.version(), SnapshotVersion::from_micros(2));
        assert_eq!(changes[1].change_type, ChangeType::Modified);
        assert_eq!(changes[2].change_type, ChangeType::Modified);
        assert_eq!(changes[2].document.version(), SnapshotVersion::from_micros(4));
    }
}
