use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::local::QueryResult;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap};
use crate::firestore::remote::{OnlineState, TargetChange};
use crate::util::assert::fail;

/// A document entering or leaving limbo for a view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Pending result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: DocumentKeySet,
    /// Documents were dropped from a limited view; the caller must re-run
    /// the query without previous results and recompute.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Local result set of one query, updated incrementally from local and remote
/// document changes.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: SyncState,
    /// The backend marked the target current and nothing invalidated it
    /// since.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reports as part of the target.
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            sync_state: SyncState::None,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Computes how `changes` would alter the view without applying them.
    /// Entries not matching the query are treated as removals.
    pub fn compute_doc_changes(
        &self,
        changes: &MutableDocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;
        let comparator = old_document_set.comparator().clone();

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()));
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new_doc, last).is_gt());
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new_doc, first).is_lt());
                            if past_last || before_first {
                                // The document moved outside the window; a
                                // document beyond the limit may belong in it.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last(),
                    LimitType::Last => document_set.first(),
                };
                let Some(evicted) = evicted.cloned() else {
                    break;
                };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes plus an optional target change and returns
    /// the resulting snapshot, if anything observable changed.
    ///
    /// With `target_is_pending_reset` the target's results are about to be
    /// replaced after an existence filter mismatch, so limbo tracking is
    /// skipped and the view is not marked synced.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let comparator = self.document_set.comparator().clone();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .order()
                .cmp(&right.change_type.order())
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);

        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops the `current` flag so listeners see cached
    /// results as such.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Resets the view to what persistence holds for its target. Used when a
    /// client takes over as primary and its views may be stale.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents.clear();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    /// Snapshot of the full current state, as seen by a newly attached
    /// listener.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == SyncState::Local,
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                fail(format!("modified document {key} not found in view"));
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<_> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    /// A document shown locally but unknown to the backend's view of the
    /// target is in limbo, unless a local write explains its presence.
    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// An acknowledged write that the watch stream has not caught up with yet
/// would flash the old value; hold the local version until it does.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::{Direction, OrderBy};
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::firestore::value::{BytesValue, FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64, rank: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_segment("rank"), FirestoreValue::from_integer(rank));
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn local_doc(path: &str, rank: i64) -> MutableDocument {
        let mut document = doc(path, 0, rank);
        document.set_has_local_mutations();
        document
    }

    fn docs(entries: Vec<MutableDocument>) -> MutableDocumentMap {
        entries
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect()
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn apply(view: &mut View, entries: Vec<MutableDocument>, target_change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&docs(entries), None);
        view.apply_changes(changes, true, target_change, false)
    }

    fn current_with(added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: BytesValue::from(vec![1u8]),
            current: true,
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    #[test]
    fn first_changes_are_additions_from_cache() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let change = apply(&mut view, vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2)], None);

        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert_eq!(snapshot.document_changes.len(), 2);
        assert!(snapshot
            .document_changes
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
    }

    #[test]
    fn current_target_marks_view_synced() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1)], None);

        let target_change = current_with(&["rooms/a"]);
        let change = apply(&mut view, Vec::new(), Some(&target_change));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.document_changes.is_empty());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        apply(&mut view, vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2)], None);

        let target_change = current_with(&["rooms/a"]);
        let change = apply(&mut view, Vec::new(), Some(&target_change));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        // Still from cache while rooms/b is unresolved, so nothing to report.
        assert!(change.snapshot.is_none());
        assert!(view.compute_initial_snapshot().from_cache);

        let mut deleted = MutableDocument::new_no_document(key("rooms/b"), SnapshotVersion::from_micros(2));
        deleted.set_read_time(SnapshotVersion::from_micros(2));
        let change = apply(&mut view, vec![deleted], None);
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn local_writes_are_not_limbo() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let target_change = current_with(&[]);
        let change = apply(&mut view, vec![local_doc("rooms/a", 1)], Some(&target_change));
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.has_pending_writes());
        assert!(!snapshot.from_cache);
    }

    #[test]
    fn limit_evicts_and_requests_refill() {
        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::from_segment("rank"), Direction::Ascending))
            .with_limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::new());
        let change = apply(
            &mut view,
            vec![doc("rooms/a", 1, 1), doc("rooms/b", 1, 2), doc("rooms/c", 1, 3)],
            None,
        );
        let snapshot = change.snapshot.unwrap();
        let keys: Vec<_> = snapshot.documents.keys().map(|key| key.id().to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let removed = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(2));
        let changes = view.compute_doc_changes(&docs(vec![removed]), None);
        assert!(changes.needs_refill);

        let refill = docs(vec![doc("rooms/b", 1, 2), doc("rooms/c", 1, 3)]);
        let changes = view.compute_doc_changes(&refill, Some(changes));
        let change = view.apply_changes(changes, true, None, false);
        let snapshot = change.snapshot.unwrap();
        let keys: Vec<_> = snapshot.documents.keys().map(|key| key.id().to_string()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Removed);
        assert_eq!(snapshot.document_changes[1].change_type, ChangeType::Added);
    }

    #[test]
    fn going_offline_reverts_to_cache() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let target_change = current_with(&["rooms/a"]);
        apply(&mut view, vec![doc("rooms/a", 1, 1)], Some(&target_change));

        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn metadata_change_when_write_is_acknowledged() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        apply(&mut view, vec![local_doc("rooms/a", 1)], None);

        let change = apply(&mut view, vec![doc("rooms/a", 2, 1)], None);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.document_changes.len(), 1);
        assert_eq!(snapshot.document_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }
}
