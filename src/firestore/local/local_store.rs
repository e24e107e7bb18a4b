use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::constants::BATCH_ID_UNKNOWN;
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::{IndexAutoCreationSettings, LruParams};
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::user::User;
use crate::firestore::error::{FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{QueryPurpose, TargetData};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, FieldIndex, MutableDocument, MutableDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::value::BytesValue;
use crate::util::assert::{fail, hard_assert};

/// Resume tokens older than this are persisted even without document
/// changes, so a restart does not replay too much.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of [`LocalStore::local_write`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    /// Local view of every document the write touched.
    pub changes: MutableDocumentMap,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: MutableDocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: DocumentKeySet,
}

/// Result of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: MutableDocumentMap,
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
}

/// Documents that entered or left a view, reported after each snapshot so
/// LRU bookkeeping and limbo-free versions stay current.
#[derive(Clone, Debug, Default)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

/// Components that depend on the current user.
struct UserComponents {
    user: User,
    mutation_queue: Arc<MutationQueue>,
    overlays: Arc<DocumentOverlayCache>,
    local_documents: Arc<LocalDocumentsView>,
}

impl UserComponents {
    fn new(
        user: User,
        index_manager: &Arc<IndexManager>,
        remote_documents: &Arc<RemoteDocumentCache>,
    ) -> Arc<Self> {
        let mutation_queue = Arc::new(MutationQueue::new(user.to_key(), Arc::clone(index_manager)));
        let overlays = Arc::new(DocumentOverlayCache::new(user.to_key()));
        let local_documents = Arc::new(LocalDocumentsView::new(
            Arc::clone(remote_documents),
            Arc::clone(&mutation_queue),
            Arc::clone(&overlays),
            Arc::clone(index_manager),
        ));
        Arc::new(Self {
            user,
            mutation_queue,
            overlays,
            local_documents,
        })
    }
}

#[derive(Default)]
struct TargetState {
    /// Active targets by id. The in-memory copy may be ahead of the
    /// persisted one; it is written back on release.
    target_data_by_id: BTreeMap<i32, TargetData>,
    /// Document references held by active views, by target.
    local_view_references: BTreeMap<i32, DocumentKeySet>,
}

impl TargetState {
    fn target_id_for(&self, target: &Target) -> Option<i32> {
        self.target_data_by_id
            .values()
            .find(|data| &data.target == target)
            .map(|data| data.target_id)
    }

    fn pinned_documents(&self) -> DocumentKeySet {
        self.local_view_references.values().flatten().cloned().collect()
    }
}

/// Local storage of the sync engine.
///
/// Combines the remote document cache, the mutation queue, document overlays
/// and the target cache into consistent local views, and applies the
/// changes arriving from local writes, write acknowledgements and watch
/// events. Every operation runs in a single persistence transaction.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    index_manager: Arc<IndexManager>,
    remote_documents: Arc<RemoteDocumentCache>,
    target_cache: Arc<TargetCache>,
    query_engine: QueryEngine,
    user_components: StdMutex<Arc<UserComponents>>,
    targets: StdMutex<TargetState>,
    target_id_generator: StdMutex<TargetIdGenerator>,
}

impl Debug for LocalStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("client_id", &self.persistence.client_id())
            .field("user", &self.current_user())
            .finish()
    }
}

impl LocalStore {
    pub fn new(
        persistence: Arc<Persistence>,
        initial_user: User,
        index_auto_creation: IndexAutoCreationSettings,
    ) -> Self {
        let index_manager = Arc::new(IndexManager::new());
        let remote_documents = Arc::new(RemoteDocumentCache::new(Arc::clone(&index_manager)));
        let user_components = UserComponents::new(initial_user, &index_manager, &remote_documents);
        Self {
            persistence,
            query_engine: QueryEngine::new(Arc::clone(&index_manager), index_auto_creation),
            index_manager,
            remote_documents,
            target_cache: Arc::new(TargetCache::new()),
            user_components: StdMutex::new(user_components),
            targets: StdMutex::new(TargetState::default()),
            target_id_generator: StdMutex::new(TargetIdGenerator::for_target_cache(0)),
        }
    }

    /// Seeds the target id watermark from the persisted target globals.
    pub async fn start(&self) -> FirestoreResult<()> {
        let target_cache = Arc::clone(&self.target_cache);
        let highest = self
            .persistence
            .run_transaction("Start LocalStore", TransactionMode::ReadOnly, |txn| {
                target_cache.get_highest_target_id(txn)
            })
            .await?;
        *self.target_id_generator.lock().unwrap() = TargetIdGenerator::for_target_cache(highest);
        log::debug!("local store started, highest target id {highest}");
        Ok(())
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        self.components().user.clone()
    }

    /// Builders for the LRU collector and backfiller over this store's
    /// caches.
    pub fn new_lru_garbage_collector(&self, params: LruParams) -> LruGarbageCollector {
        LruGarbageCollector::new(
            params,
            Arc::clone(&self.target_cache),
            Arc::clone(&self.remote_documents),
        )
    }

    pub fn new_index_backfiller(&self) -> IndexBackfiller {
        IndexBackfiller::new(Arc::clone(&self.index_manager), Arc::clone(&self.remote_documents))
    }

    fn components(&self) -> Arc<UserComponents> {
        Arc::clone(&self.user_components.lock().unwrap())
    }

    /// Switches the mutation queue and overlays to `user` and returns the
    /// documents whose local view changed as a result.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old = self.components();
        let new = UserComponents::new(user, &self.index_manager, &self.remote_documents);
        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old.mutation_queue.get_all_mutation_batches(txn)?;
                let new_batches = new.mutation_queue.get_all_mutation_batches(txn)?;
                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(&new_batches) {
                    changed_keys.extend(batch.keys());
                }
                let affected_documents = new.local_documents.get_documents(txn, &changed_keys)?;
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;
        log::debug!("local store switched to user {}", new.user);
        *self.user_components.lock().unwrap() = new;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local view of the
    /// documents it touches.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let components = self.components();
        let remote_documents = Arc::clone(&self.remote_documents);
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote = remote_documents.get_entries(txn, &keys)?;
                let documents_without_remote_version: DocumentKeySet = remote
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = components.local_documents.get_overlayed_documents(txn, remote)?;

                // Non-idempotent transforms need the value they started from
                // so the local view stays stable if the write is re-applied.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(document) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&document.document) {
                        let mask = base_value.field_mask();
                        base_mutations.push(Mutation::patch(
                            mutation.key().clone(),
                            base_value,
                            mask,
                            Precondition::Exists(true),
                        ));
                    }
                }

                let batch = components.mutation_queue.add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                components
                    .overlays
                    .save_overlays(txn, batch.batch_id, &overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies a successful write response: the batch's effect is folded into
    /// the remote documents and the batch leaves the queue.
    pub async fn acknowledge_batch(
        &self,
        batch_result: MutationBatchResult,
    ) -> FirestoreResult<MutableDocumentMap> {
        let components = self.components();
        let remote_documents = Arc::clone(&self.remote_documents);
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let affected = batch.keys();
                components
                    .mutation_queue
                    .acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
                apply_write_to_remote_documents(
                    txn,
                    &remote_documents,
                    &components.mutation_queue,
                    &batch_result,
                )?;
                components.mutation_queue.perform_consistency_check(txn)?;
                components
                    .overlays
                    .remove_overlays_for_batch_id(txn, &affected, batch.batch_id)?;
                let transformed = keys_with_transform_results(&batch_result);
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, &transformed)?;
                components.local_documents.get_documents(txn, &affected)
            })
            .await
    }

    /// Drops a batch the backend rejected and returns the restored local view
    /// of its documents.
    pub async fn reject_batch(&self, batch_id: i32) -> FirestoreResult<MutableDocumentMap> {
        let components = self.components();
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let Some(batch) = components.mutation_queue.lookup_mutation_batch(txn, batch_id)? else {
                    fail(format!("Attempt to reject nonexistent batch {batch_id}"));
                };
                let affected = batch.keys();
                components.mutation_queue.remove_mutation_batch(txn, &batch)?;
                components.mutation_queue.perform_consistency_check(txn)?;
                components
                    .overlays
                    .remove_overlays_for_batch_id(txn, &affected, batch_id)?;
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                components.local_documents.get_documents(txn, &affected)
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32> {
        let components = self.components();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                Ok(components.mutation_queue.get_highest_unacknowledged_batch_id(txn))
            })
            .await
    }

    pub async fn lookup_mutation_batch(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        let components = self.components();
        self.persistence
            .run_transaction("Lookup mutation batch", TransactionMode::ReadOnly, |txn| {
                components.mutation_queue.lookup_mutation_batch(txn, batch_id)
            })
            .await
    }

    /// First queued batch with an id above `after_batch_id`; `None` passes
    /// the start of the queue.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>> {
        let components = self.components();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                components
                    .mutation_queue
                    .get_next_mutation_batch_after_batch_id(txn, after)
            })
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<BytesValue> {
        let components = self.components();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                components.mutation_queue.get_last_stream_token(txn)
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: BytesValue) -> FirestoreResult<()> {
        let components = self.components();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                components
                    .mutation_queue
                    .set_last_stream_token(txn, stream_token.clone())
            })
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let target_cache = Arc::clone(&self.target_cache);
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                target_cache.get_last_remote_snapshot_version(txn)
            })
            .await
    }

    /// Applies a consistent watch snapshot. Returns the new local view of
    /// every document the event changed.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<MutableDocumentMap> {
        let components = self.components();
        let remote_version = event.snapshot_version;
        let current_targets = self.targets.lock().unwrap().target_data_by_id.clone();
        let target_cache = Arc::clone(&self.target_cache);
        let remote_documents = Arc::clone(&self.remote_documents);

        let (changes, updated_targets) = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &event.target_changes {
                    let Some(old) = current_targets.get(target_id) else {
                        continue;
                    };
                    target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut updated = old.with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(BytesValue::empty(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(old, &updated, change) {
                        target_cache.update_target_data(txn, &updated)?;
                    }
                    updated_targets.insert(*target_id, updated);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        target_cache.update_sentinel(txn, key)?;
                    }
                }

                let (changed, existence_changed) =
                    populate_document_changes(txn, &remote_documents, &event.document_updates)?;

                if !remote_version.is_min() {
                    let last = target_cache.get_last_remote_snapshot_version(txn)?;
                    hard_assert(
                        remote_version >= last,
                        format!("Watch stream reverted to previous snapshot? {remote_version} < {last}"),
                    );
                    target_cache.set_last_remote_snapshot_version(txn, remote_version)?;
                }

                let changes = components.local_documents.get_local_view_of_documents(
                    txn,
                    changed,
                    &existence_changed,
                )?;
                Ok((changes, updated_targets))
            })
            .await?;

        self.targets
            .lock()
            .unwrap()
            .target_data_by_id
            .extend(updated_targets);
        Ok(changes)
    }

    /// Records which documents entered or left each view. Marks views that
    /// are no longer from cache as limbo-free at their snapshot version.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        let target_cache = Arc::clone(&self.target_cache);
        let result = self
            .persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in &view_changes {
                    for key in change.added_keys.iter().chain(&change.removed_keys) {
                        target_cache.update_sentinel(txn, key)?;
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {}
            // Sequence number updates are best effort.
            Err(err) if err.code == FirestoreErrorCode::Unavailable => {
                log::debug!("failed to update sequence numbers: {err}");
            }
            Err(err) => return Err(err),
        }

        let mut targets = self.targets.lock().unwrap();
        for change in view_changes {
            let references = targets.local_view_references.entry(change.target_id).or_default();
            references.extend(change.added_keys.iter().cloned());
            for key in &change.removed_keys {
                references.remove(key);
            }
            if !change.from_cache {
                let Some(data) = targets.target_data_by_id.get(&change.target_id) else {
                    fail(format!("Can't set limbo-free snapshot version for unknown target {}", change.target_id));
                };
                let updated = data.with_last_limbo_free_snapshot_version(data.snapshot_version);
                targets.target_data_by_id.insert(change.target_id, updated);
            }
        }
        Ok(())
    }

    /// Reads the local view of one document.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let components = self.components();
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                components.local_documents.get_document(txn, key)
            })
            .await
    }

    /// Returns the cached data for `target`, creating and persisting a new
    /// target on first use.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_cache = Arc::clone(&self.target_cache);
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = self.target_id_generator.lock().unwrap().next();
                let data = TargetData::new(
                    target.clone(),
                    target_id,
                    QueryPurpose::Listen,
                    txn.current_sequence_number(),
                );
                target_cache.add_target_data(txn, &data)?;
                Ok(data)
            })
            .await?;

        let mut targets = self.targets.lock().unwrap();
        let newer = targets
            .target_data_by_id
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if newer {
            targets
                .target_data_by_id
                .insert(target_data.target_id, target_data.clone());
        }
        Ok(targets
            .target_data_by_id
            .get(&target_data.target_id)
            .cloned()
            .unwrap_or(target_data))
    }

    /// Stops tracking an active target. Unless `keep_persisted_target_data`
    /// is set, its data is written back with a fresh sequence number so LRU
    /// collection can pick it up later.
    pub async fn release_target(&self, target_id: i32, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.targets.lock().unwrap().target_data_by_id.get(&target_id).cloned() else {
            fail(format!("Tried to release nonexistent target: {target_id}"));
        };
        if !keep_persisted_target_data {
            let target_cache = Arc::clone(&self.target_cache);
            let result = self
                .persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    let updated = target_data.with_sequence_number(txn.current_sequence_number());
                    target_cache.update_target_data(txn, &updated)
                })
                .await;
            match result {
                Ok(()) => {}
                Err(err) if err.code == FirestoreErrorCode::Unavailable || err.is_primary_lease_lost() => {
                    log::debug!("failed to update sequence numbers for target {target_id}: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        let mut targets = self.targets.lock().unwrap();
        targets.target_data_by_id.remove(&target_id);
        targets.local_view_references.remove(&target_id);
        Ok(())
    }

    /// Whether `target_id` is currently allocated.
    pub fn is_active_target(&self, target_id: i32) -> bool {
        self.targets
            .lock()
            .unwrap()
            .target_data_by_id
            .contains_key(&target_id)
    }

    pub fn active_target_data(&self, target_id: i32) -> Option<TargetData> {
        self.targets
            .lock()
            .unwrap()
            .target_data_by_id
            .get(&target_id)
            .cloned()
    }

    /// Target data for `target_id`, active or persisted by any client.
    pub async fn get_target_data(&self, target_id: i32) -> FirestoreResult<Option<TargetData>> {
        if let Some(active) = self.active_target_data(target_id) {
            return Ok(Some(active));
        }
        let target_cache = Arc::clone(&self.target_cache);
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                target_cache.get_target_data_by_id(txn, target_id)
            })
            .await
    }

    /// Runs `query` against the local cache. With `use_previous_results`
    /// the target's last results seed the computation.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let components = self.components();
        let target = query.listen_target();
        let active = {
            let targets = self.targets.lock().unwrap();
            targets
                .target_id_for(&target)
                .and_then(|id| targets.target_data_by_id.get(&id).cloned())
        };
        let target_cache = Arc::clone(&self.target_cache);
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target_data = match &active {
                    Some(data) => Some(data.clone()),
                    None => target_cache.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::new()),
                };
                let documents = if use_previous_results {
                    self.query_engine.get_documents_matching_query(
                        txn,
                        &components.local_documents,
                        query,
                        last_limbo_free,
                        &remote_keys,
                    )?
                } else {
                    self.query_engine.get_documents_matching_query(
                        txn,
                        &components.local_documents,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
            .await
    }

    /// Keys the backend last reported for `target_id`.
    pub async fn get_remote_document_keys(&self, target_id: i32) -> FirestoreResult<DocumentKeySet> {
        let target_cache = Arc::clone(&self.target_cache);
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
            .await
    }

    pub async fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let (active, pinned) = {
            let targets = self.targets.lock().unwrap();
            let active: BTreeSet<i32> = targets.target_data_by_id.keys().copied().collect();
            (active, targets.pinned_documents())
        };
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &active, &pinned)
            })
            .await
    }

    pub async fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                backfiller.backfill(txn)
            })
            .await
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Makes the configured client-side indexes exactly `new_indexes`.
    pub async fn configure_field_indexes(&self, new_indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let index_manager = Arc::clone(&self.index_manager);
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = index_manager.get_field_indexes(txn, None)?;
                for index in &existing {
                    if !new_indexes.iter().any(|other| other.same_definition(index)) {
                        index_manager.delete_field_index(txn, index.index_id);
                    }
                }
                for index in &new_indexes {
                    if !existing.iter().any(|other| other.same_definition(index)) {
                        index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        let index_manager = Arc::clone(&self.index_manager);
        self.persistence
            .run_transaction("Delete all indexes", TransactionMode::ReadWrite, |txn| {
                index_manager.delete_all_field_indexes(txn);
                Ok(())
            })
            .await
    }
}

fn apply_write_to_remote_documents(
    txn: &mut PersistenceTransaction<'_>,
    remote_documents: &RemoteDocumentCache,
    mutation_queue: &MutationQueue,
    batch_result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let batch = &batch_result.batch;
    for key in batch.keys() {
        let mut document = remote_documents.get_entry(txn, &key)?;
        let Some(ack_version) = batch_result.doc_versions.get(&key) else {
            fail(format!("doc_versions should contain every acknowledged key, missing {key}"));
        };
        if document.version() < *ack_version {
            batch.apply_to_remote_document(&mut document, batch_result);
            if document.is_valid_document() {
                remote_documents.add_entry(txn, &document, batch_result.commit_version)?;
            }
        }
    }
    mutation_queue.remove_mutation_batch(txn, batch)
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> DocumentKeySet {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(&batch_result.mutation_results)
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

/// Writes the documents of a watch snapshot that are newer than the cached
/// ones. Returns the accepted documents and the keys whose existence flipped.
fn populate_document_changes(
    txn: &mut PersistenceTransaction<'_>,
    remote_documents: &RemoteDocumentCache,
    updates: &MutableDocumentMap,
) -> FirestoreResult<(MutableDocumentMap, DocumentKeySet)> {
    let existing = remote_documents.get_entries(txn, updates.keys())?;
    let mut changed = MutableDocumentMap::new();
    let mut existence_changed = DocumentKeySet::new();
    for (key, document) in updates {
        let Some(cached) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != cached.is_found_document() {
            existence_changed.insert(key.clone());
        }
        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes after losing access to a target: the
            // document leaves the cache.
            remote_documents.remove_entry(txn, key)?;
            changed.insert(key.clone(), document.clone());
        } else if !cached.is_valid_document()
            || document.version() > cached.version()
            || (document.version() == cached.version() && cached.has_pending_writes())
        {
            remote_documents.add_entry(txn, document, document.read_time())?;
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {}, watch version {}",
                cached.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.document_change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, MutationResult, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: &str) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_segment(field), FirestoreValue::from(value));
        map
    }

    async fn store() -> LocalStore {
        let persistence = Persistence::memory("client").unwrap();
        let store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
        store.start().await.unwrap();
        store
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn ack(batch: MutationBatch, version: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(SnapshotVersion::from_micros(version), Vec::new()))
            .collect();
        MutationBatchResult::from(
            batch,
            SnapshotVersion::from_micros(version),
            results,
            BytesValue::from(vec![1u8]),
        )
    }

    fn found(path: &str, version: i64, name: &str) -> MutableDocument {
        let mut document =
            MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data("name", name));
        document.set_read_time(SnapshotVersion::from_micros(version));
        document
    }

    #[tokio::test]
    async fn local_write_then_ack_clears_pending_writes() {
        let store = store().await;
        let write = store
            .local_write(vec![Mutation::set(key("rooms/1"), data("name", "A"))])
            .await
            .unwrap();
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), write.batch_id);
        let local = &write.changes[&key("rooms/1")];
        assert!(local.has_local_mutations());
        assert_eq!(local.data(), &data("name", "A"));

        let batch = store.lookup_mutation_batch(write.batch_id).await.unwrap().unwrap();
        let changes = store.acknowledge_batch(ack(batch, 10)).await.unwrap();
        let acked = &changes[&key("rooms/1")];
        assert!(!acked.has_local_mutations());
        assert_eq!(acked.data(), &data("name", "A"));
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), BATCH_ID_UNKNOWN);
        assert_eq!(store.get_last_stream_token().await.unwrap(), BytesValue::from(vec![1u8]));
    }

    #[tokio::test]
    async fn reject_restores_remote_version() {
        let store = store().await;
        let target = store.allocate_target(rooms().listen_target()).await.unwrap();
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(5),
            ..RemoteEvent::default()
        };
        event.document_updates.insert(key("rooms/1"), found("rooms/1", 5, "remote"));
        let mut change = TargetChange::default();
        change.added_documents.insert(key("rooms/1"));
        event.target_changes.insert(target.target_id, change);
        store.apply_remote_event(event).await.unwrap();

        let write = store
            .local_write(vec![Mutation::set(key("rooms/1"), data("name", "local"))])
            .await
            .unwrap();
        assert_eq!(write.changes[&key("rooms/1")].data(), &data("name", "local"));

        let restored = store.reject_batch(write.batch_id).await.unwrap();
        let document = &restored[&key("rooms/1")];
        assert_eq!(document.data(), &data("name", "remote"));
        assert!(!document.has_local_mutations());
    }

    #[tokio::test]
    async fn stale_watch_updates_are_dropped() {
        let store = store().await;
        let target = store.allocate_target(rooms().listen_target()).await.unwrap();
        for (version, name) in [(10, "new"), (5, "old")] {
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::from_micros(10),
                ..RemoteEvent::default()
            };
            event
                .document_updates
                .insert(key("rooms/1"), found("rooms/1", version, name));
            event.target_changes.insert(target.target_id, TargetChange::default());
            store.apply_remote_event(event).await.unwrap();
        }
        let document = store.read_document(&key("rooms/1")).await.unwrap();
        assert_eq!(document.data(), &data("name", "new"));
    }

    #[tokio::test]
    async fn target_ids_resume_after_restart() {
        let path = std::env::temp_dir().join(format!("firestore-sync-local-store-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let first_id = {
            let persistence = Persistence::file(&path, "client").unwrap();
            assert!(persistence.try_acquire_primary_lease().await.unwrap());
            let store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
            store.start().await.unwrap();
            let data = store.allocate_target(rooms().listen_target()).await.unwrap();
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::from_micros(7),
                ..RemoteEvent::default()
            };
            event.target_changes.insert(
                data.target_id,
                TargetChange::synthesized_for_current_change(true, BytesValue::from(vec![9u8])),
            );
            store.apply_remote_event(event).await.unwrap();
            store.persistence().release_primary_lease().await.unwrap();
            store.persistence().shutdown().await;
            data.target_id
        };

        let persistence = Persistence::file(&path, "client").unwrap();
        let store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
        store.start().await.unwrap();
        let reused = store.allocate_target(rooms().listen_target()).await.unwrap();
        assert_eq!(reused.target_id, first_id);
        assert_eq!(reused.resume_token, BytesValue::from(vec![9u8]));
        assert_eq!(reused.snapshot_version, SnapshotVersion::from_micros(7));

        let users = Query::new(ResourcePath::from_string("users").unwrap());
        let fresh = store.allocate_target(users.listen_target()).await.unwrap();
        assert!(fresh.target_id > first_id);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn user_change_swaps_mutation_queues() {
        let store = store().await;
        store
            .local_write(vec![Mutation::set(key("rooms/1"), data("name", "anon"))])
            .await
            .unwrap();
        let result = store.handle_user_change(User::new("alice")).await.unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/1")].is_found_document());
        assert_eq!(store.current_user(), User::new("alice"));
    }

    #[tokio::test]
    async fn execute_query_merges_pending_writes() {
        let store = store().await;
        store
            .local_write(vec![Mutation::set(key("rooms/1"), data("name", "A"))])
            .await
            .unwrap();
        let result = store.execute_query(&rooms(), true).await.unwrap();
        assert_eq!(result.documents.len(), 1);
        assert!(result.remote_keys.is_empty());
    }
}
