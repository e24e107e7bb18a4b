use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::local::target_data::{QueryPurpose, TargetData};
use crate::firestore::model::{
    DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion,
};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::firestore::value::BytesValue;
use crate::util::assert::hard_assert;

/// Provides metadata about active targets so the aggregator can reason about
/// existing documents.
pub trait TargetMetadataProvider: Send + Sync {
    /// Documents the local store currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet;

    /// Target data of `target_id` if it is still being listened to.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;

    fn database_id(&self) -> DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Accumulated changes of one target since the last remote event.
struct TargetState {
    /// Outstanding listen/unlisten requests. Changes are ignored while
    /// non-zero since they may belong to an earlier incarnation.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: BytesValue,
    current: bool,
    /// Starts out true so a freshly added target always produces a change.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Default::default(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &BytesValue) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            "received a target response without a pending request",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds listen-stream messages into [`RemoteEvent`]s.
///
/// Changes for targets with outstanding requests are dropped; document
/// updates are buffered until [`create_remote_event`](Self::create_remote_event)
/// is called at a consistent snapshot.
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: MutableDocumentMap,
    /// Targets each document was updated (not merely removed) in.
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<i32>>,
    /// Every target a document was reported in, used to find documents
    /// only limbo targets know about.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, QueryPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata,
            target_states: BTreeMap::new(),
            pending_document_updates: MutableDocumentMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_watch_change(&mut self, change: WatchChange) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(&change),
            WatchChange::DocumentChange(change) => self.handle_document_change(change),
            WatchChange::ExistenceFilter(change) => self.handle_existence_filter(&change),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone());
                }
                _ => self.remove_document_from_target(*target_id, &change.key, change.new_document.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_document.clone());
        }
    }

    /// Applies a target state transition. Errored removals must be handled
    /// by the caller before they reach the aggregator.
    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.affected_targets(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A new incarnation starts from scratch.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "the watch aggregator does not handle errored targets",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Reconciles the backend's document count for a target with the local
    /// view of it, using the Bloom filter to pinpoint removals when one was
    /// sent. Unresolvable mismatches reset the target.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document does not exist on the backend.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(tombstone));
                }
            } else {
                hard_assert(
                    expected_count == 1,
                    "single document existence filter with a count other than 0 or 1",
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == i64::from(expected_count) {
            return;
        }
        let status = match self.parse_bloom_filter(change) {
            Some(filter) => self.apply_bloom_filter(&filter, change, current_count),
            None => BloomFilterApplication::Skipped,
        };
        log::debug!(
            "existence filter mismatch for target {target_id}: local {current_count}, remote \
             {expected_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplication::Success {
            self.reset_target(target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                QueryPurpose::ExistenceFilterMismatchBloom
            } else {
                QueryPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Drains everything accumulated so far into an event at
    /// `snapshot_version`.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target that never reported its document
                // proves the document is gone; this resolves limbo documents.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated_here = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map(|targets| targets.contains(&target_id))
                        .unwrap_or(false);
                    if !updated_here && !self.target_contains_document(target_id, &key) {
                        let tombstone = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(tombstone));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map(|data| data.purpose == QueryPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        for document in self.pending_document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();
        event
    }

    /// Called when a listen or unlisten request for `target_id` is sent.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn affected_targets(&self, change: &WatchTargetChange) -> Vec<i32> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id))
            .collect()
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let payload = change.existence_filter.unchanged_names.as_ref()?;
        match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
            Ok(filter) if filter.bit_count() > 0 => Some(filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let removed = self.filter_removed_documents(filter, change.target_id);
        if i64::from(change.existence_filter.count) == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every known document of the target that the filter does not
    /// contain and returns how many were removed.
    fn filter_removed_documents(&mut self, filter: &BloomFilter, target_id: i32) -> i64 {
        let database_id = self.metadata.database_id();
        let mut removed = 0;
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            if !filter.might_contain(&database_id.document_name(&key)) {
                self.remove_document_from_target(target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    fn add_document_to_target(&mut self, target_id: i32, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Number of documents the target will hold once the pending changes
    /// are applied.
    fn current_document_count_for_target(&mut self, target_id: i32) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        let existing = self.metadata.get_remote_keys_for_target(target_id).len() as i64;
        existing + change.added_documents.len() as i64 - change.removed_documents.len() as i64
    }

    /// Starts the target over and removes every document it held. The
    /// removals become part of the next snapshot unless watch resends them.
    fn reset_target(&mut self, target_id: i32) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .map(TargetState::is_pending)
                .unwrap_or(false),
            "only active targets can be reset",
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: i32) -> bool {
        let active = self.target_data_for_active_target(target_id).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: i32) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(&self, target_id: i32, key: &DocumentKey) -> bool {
        self.metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::Target;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::remote::bloom_filter::build_payload;
    use crate::firestore::remote::watch_change::ExistenceFilter;
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct FakeMetadata {
        targets: StdMutex<BTreeMap<i32, TargetData>>,
        remote_keys: StdMutex<BTreeMap<i32, DocumentKeySet>>,
    }

    impl FakeMetadata {
        fn listen(&self, target_id: i32, target: Target, purpose: QueryPurpose) {
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
        }

        fn set_keys(&self, target_id: i32, keys: &[DocumentKey]) {
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, keys.iter().cloned().collect());
        }
    }

    impl TargetMetadataProvider for FakeMetadata {
        fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }

        fn database_id(&self) -> DatabaseId {
            DatabaseId::default("project")
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), MapValue::default())
    }

    fn collection_target() -> Target {
        Query::new(ResourcePath::from_string("rooms").unwrap()).to_target()
    }

    fn setup() -> (Arc<FakeMetadata>, WatchChangeAggregator) {
        let metadata = Arc::new(FakeMetadata::default());
        let aggregator = WatchChangeAggregator::new(metadata.clone());
        (metadata, aggregator)
    }

    #[test]
    fn documents_are_classified_against_remote_keys() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        metadata.set_keys(2, &[key("rooms/b"), key("rooms/c")]);

        aggregator.handle_document_change(DocumentWatchChange::updated(doc("rooms/a", 3), vec![2], vec![]));
        aggregator.handle_document_change(DocumentWatchChange::updated(doc("rooms/b", 3), vec![2], vec![]));
        aggregator.handle_document_change(DocumentWatchChange::removed(key("rooms/c"), vec![2]));
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Current, vec![2])
                .with_resume_token(BytesValue::new(vec![1])),
        );

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, BytesValue::new(vec![1]));
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(change.modified_documents.contains(&key("rooms/b")));
        assert!(change.removed_documents.contains(&key("rooms/c")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(
            event.document_updates[&key("rooms/a")].read_time(),
            SnapshotVersion::from_micros(3)
        );

        // Everything was drained.
        let empty = aggregator.create_remote_event(SnapshotVersion::from_micros(4));
        assert!(empty.target_changes.is_empty());
        assert!(empty.document_updates.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(DocumentWatchChange::updated(doc("rooms/a", 1), vec![2], vec![]));
        assert!(aggregator
            .create_remote_event(SnapshotVersion::from_micros(1))
            .document_updates
            .is_empty());

        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Added, vec![2]));
        aggregator.handle_document_change(DocumentWatchChange::updated(doc("rooms/a", 2), vec![2], vec![]));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(2));
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_a_delete() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(1, Target::for_document(&key("rooms/gone")), QueryPurpose::LimboResolution);

        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![1]));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(9));

        let tombstone = &event.document_updates[&key("rooms/gone")];
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), SnapshotVersion::from_micros(9));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
    }

    #[test]
    fn documents_seen_by_listen_targets_are_not_limbo_resolutions() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(1, Target::for_document(&key("rooms/a")), QueryPurpose::LimboResolution);
        metadata.listen(2, collection_target(), QueryPurpose::Listen);

        aggregator.handle_document_change(DocumentWatchChange::updated(doc("rooms/a", 1), vec![1, 2], vec![]));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn bloom_filter_removes_missing_documents() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        let keys: Vec<DocumentKey> = (0..10).map(|i| key(&format!("rooms/doc{i}"))).collect();
        metadata.set_keys(2, &keys);

        let database_id = metadata.database_id();
        let kept: Vec<String> = keys[..4]
            .iter()
            .map(|key| database_id.document_name(key))
            .collect();
        // Large enough that a false positive among six names is negligible.
        let payload = build_payload(&kept, 512, 7);
        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter::with_bloom_filter(4, payload),
        });

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 6);
        assert_eq!(keys.len() - change.removed_documents.len(), 4);
        for key in &keys[..4] {
            assert!(!change.removed_documents.contains(key));
        }
    }

    #[test]
    fn mismatch_without_bloom_filter_resets_target() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        metadata.set_keys(2, &[key("rooms/a"), key("rooms/b")]);

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter::new(1),
        });
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&QueryPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn unresolvable_bloom_filter_is_a_false_positive_mismatch() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        let keys = [key("rooms/a"), key("rooms/b"), key("rooms/c")];
        metadata.set_keys(2, &keys);

        // Every name is in the filter, so nothing can be removed.
        let names: Vec<String> = keys
            .iter()
            .map(|key| metadata.database_id().document_name(key))
            .collect();
        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter::with_bloom_filter(1, build_payload(&names, 64, 5)),
        });
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&QueryPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn zero_count_on_document_target_deletes_the_document() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(4, Target::for_document(&key("rooms/a")), QueryPurpose::Listen);
        metadata.set_keys(4, &[key("rooms/a")]);

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 4,
            existence_filter: ExistenceFilter::new(0),
        });
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert!(event.target_changes[&4].removed_documents.contains(&key("rooms/a")));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn reset_clears_current_and_removes_known_documents() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target(), QueryPurpose::Listen);
        metadata.set_keys(2, &[key("rooms/a")]);

        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![2]));
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Reset, vec![2]));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        let change = &event.target_changes[&2];
        assert!(!change.current);
        assert!(change.removed_documents.contains(&key("rooms/a")));
    }
}
