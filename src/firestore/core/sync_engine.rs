use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::constants::{BATCH_ID_UNKNOWN, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::user::User;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{cancelled, ignore_if_primary_lease_loss, FirestoreError, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::INVALID_SEQUENCE_NUMBER;
use crate::firestore::local::shared_client_state::MutationBatchState;
use crate::firestore::local::{LocalStore, LocalViewChanges, QueryPurpose, QueryTargetState, SharedClientState, TargetData};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, Mutation, MutationBatchResult, SnapshotVersion,
};
use crate::firestore::remote::{OnlineState, RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::firestore::value::BytesValue;
use crate::util::assert::{fail, hard_assert};

/// Receives the output of the sync engine. Implemented by the event
/// manager.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// `query` failed and its view was dropped.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Who reported an online state change. Each client trusts only the source
/// matching its role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

pub type WriteAcknowledgement = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
    listens_to_remote: bool,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// The limbo target reported the document, so the next removal or
    /// synthesized delete must go through it.
    received_document: bool,
}

struct SyncEngineState {
    /// Keyed by query canonical id.
    query_views: BTreeMap<String, QueryView>,
    /// Queries sharing each target, by canonical id. Queries differing only
    /// in their limit share a target.
    queries_by_target: BTreeMap<i32, Vec<String>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// (key, target id) pairs of views holding a document in limbo.
    limbo_document_refs: BTreeSet<(DocumentKey, i32)>,
    /// Write acknowledgements per user key and batch id.
    mutation_user_callbacks: BTreeMap<String, BTreeMap<i32, oneshot::Sender<FirestoreResult<()>>>>,
    pending_writes_callbacks: BTreeMap<i32, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    limbo_target_ids: TargetIdGenerator,
    current_user: User,
    /// Unset until the client learns its role.
    is_primary: Option<bool>,
    online_state: OnlineState,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn is_limbo_referenced(&self, key: &DocumentKey) -> bool {
        self.limbo_document_refs
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }

    fn target_listens_to_remote(&self, target_id: i32) -> bool {
        self.queries_by_target.get(&target_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.query_views.get(id))
                .any(|query_view| query_view.listens_to_remote)
        })
    }
}

/// Ties the local store, the remote store and the views of active queries
/// together.
///
/// Every public operation runs as a job on the client's async queue. The
/// engine owns the views, tracks limbo documents and resolves them with
/// dedicated targets, and settles write acknowledgements.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    listener: Arc<dyn SyncEngineListener>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
    /// Remote keys per target, read synchronously by the remote store.
    remote_keys: StdMutex<BTreeMap<i32, DocumentKeySet>>,
}

impl SyncEngine {
    /// Creates the engine and registers it as the remote store's syncer.
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        listener: Arc<dyn SyncEngineListener>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            listener,
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: BTreeSet::new(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
            }),
            remote_keys: StdMutex::new(BTreeMap::new()),
        });
        let weak: Weak<SyncEngine> = Arc::downgrade(&engine);
        let syncer: Weak<dyn RemoteSyncer> = weak;
        engine.remote_store.set_syncer(syncer);
        engine
    }

    /// Engine with the default limbo resolution cap.
    pub fn with_defaults(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        listener: Arc<dyn SyncEngineListener>,
        current_user: User,
    ) -> Arc<Self> {
        Self::new(
            local_store,
            remote_store,
            shared_client_state,
            listener,
            current_user,
            DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
        )
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Creates the view for `query` and returns its first snapshot. With
    /// `should_listen_to_remote` the query's target is also listened to on
    /// the watch stream.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let mut state = self.state.lock().await;
        let canonical_id = query.canonical_id();
        if let Some(query_view) = state.query_views.get(&canonical_id) {
            self.shared_client_state.add_local_query_target(query_view.target_id);
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.listen_target()).await?;
        let target_id = target_data.target_id;
        let status = self.shared_client_state.add_local_query_target(target_id);
        let already_remote = state.target_listens_to_remote(target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                &mut state,
                query,
                target_id,
                status == QueryTargetState::Current,
                target_data.resume_token.clone(),
                should_listen_to_remote,
            )
            .await?;

        if should_listen_to_remote && !already_remote {
            self.remote_store.listen(target_data).await;
        }
        Ok(snapshot)
    }

    /// Starts listening remotely to a query whose view so far served
    /// cache-only listeners.
    pub async fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
            return Ok(());
        };
        if query_view.listens_to_remote {
            return Ok(());
        }
        let target_id = query_view.target_id;
        let already_remote = state.target_listens_to_remote(target_id);
        if let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) {
            query_view.listens_to_remote = true;
        }
        if !already_remote {
            let target_data = self.local_store.allocate_target(query.listen_target()).await?;
            self.remote_store.listen(target_data).await;
        }
        Ok(())
    }

    /// Drops the view for `query`. The target is released once no query
    /// shares it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_from_remote: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let canonical_id = query.canonical_id();
        let Some(query_view) = state.query_views.get(&canonical_id) else {
            log::debug!("unlisten for unknown query {canonical_id}");
            return Ok(());
        };
        let target_id = query_view.target_id;
        let should_unlisten_from_remote = should_unlisten_from_remote && query_view.listens_to_remote;

        let shared = state
            .queries_by_target
            .get(&target_id)
            .is_some_and(|ids| ids.len() > 1);
        if shared {
            if let Some(ids) = state.queries_by_target.get_mut(&target_id) {
                ids.retain(|id| id != &canonical_id);
            }
            state.query_views.remove(&canonical_id);
            if should_unlisten_from_remote && !state.target_listens_to_remote(target_id) {
                self.remote_store.unlisten(target_id).await;
            }
            self.publish_remote_keys(&state);
            return Ok(());
        }

        if state.is_primary() {
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                // Another client still listens through this primary.
                return Ok(());
            }
            let released = self.local_store.release_target(target_id, false).await;
            if released.is_ok() {
                self.shared_client_state.clear_query_state(target_id);
            }
            ignore_if_primary_lease_loss(released)?;
            if should_unlisten_from_remote {
                self.remote_store.unlisten(target_id).await;
            }
            self.remove_and_cleanup_target(&mut state, target_id, None).await;
            Ok(())
        } else {
            self.remove_and_cleanup_target(&mut state, target_id, None).await;
            self.local_store.release_target(target_id, true).await
        }
    }

    /// Stops listening remotely while cache-only listeners keep the view.
    pub async fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
            return Ok(());
        };
        if !query_view.listens_to_remote {
            return Ok(());
        }
        query_view.listens_to_remote = false;
        let target_id = query_view.target_id;
        if !state.target_listens_to_remote(target_id) {
            self.remote_store.unlisten(target_id).await;
        }
        Ok(())
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// returned receiver settles once the backend accepts or rejects the
    /// batch.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteAcknowledgement> {
        let mut state = self.state.lock().await;
        let result = self.local_store.local_write(mutations).await?;
        self.shared_client_state.add_pending_mutation(result.batch_id);

        let (sender, receiver) = oneshot::channel();
        let user_key = state.current_user.to_key();
        state
            .mutation_user_callbacks
            .entry(user_key)
            .or_default()
            .insert(result.batch_id, sender);

        self.emit_new_snaps_and_notify_local_store(&mut state, &result.changes, None)
            .await?;
        drop(state);
        self.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    /// Resolves once every write queued so far is acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> FirestoreResult<WriteAcknowledgement> {
        let (sender, receiver) = oneshot::channel();
        if !self.remote_store.can_use_network().await {
            log::debug!("network is disabled; pending writes will not settle until it is enabled");
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id().await?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
            return Ok(receiver);
        }
        self.state
            .lock()
            .await
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    /// Applies an online state change from `source`, ignoring reports from
    /// the source this client's role does not trust.
    pub async fn apply_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource) {
        let mut state = self.state.lock().await;
        let trusted = match source {
            OnlineStateSource::RemoteStore => state.is_primary(),
            OnlineStateSource::SharedClientState => !state.is_primary(),
        };
        if !trusted {
            return;
        }
        let mut snapshots = Vec::new();
        for query_view in state.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                change.limbo_changes.is_empty(),
                "OnlineState should not affect limbo documents.",
            );
            if let Some(snapshot) = change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.listener.on_online_state_change(online_state);
        if !snapshots.is_empty() {
            self.listener.on_watch_change(snapshots);
        }
        state.online_state = online_state;
        if state.is_primary() {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Switches the engine to `user` if it differs from the current one.
    /// The streams are restarted around the switch.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.state.lock().await.current_user == user {
            return Ok(());
        }
        log::debug!("user changed to {user}");
        self.remote_store
            .handle_credential_change(|| self.apply_user_change(user))
            .await
    }

    async fn apply_user_change(&self, user: User) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.current_user == user {
            return Ok(());
        }
        state.current_user = user.clone();
        reject_pending_writes_callbacks(&mut state, "pending writes wait cancelled by a user change");

        let result = self.local_store.handle_user_change(user.clone()).await?;
        self.shared_client_state
            .handle_user_change(&user, &result.removed_batch_ids, &result.added_batch_ids);
        self.emit_new_snaps_and_notify_local_store(&mut state, &result.affected_documents, None)
            .await
    }

    /// Adopts the primary or secondary role. A new primary rebuilds its
    /// views from persistence and takes over the network.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if is_primary && state.is_primary != Some(true) {
            let active_targets: Vec<i32> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_views_and_raise_snapshots(&mut state, &active_targets, true)
                .await?;
            state.is_primary = Some(true);
            self.publish_remote_keys(&state);
            drop(state);
            self.remote_store.apply_primary_state(true).await?;
            let state = self.state.lock().await;
            for target_data in active_queries {
                if state.target_listens_to_remote(target_data.target_id) {
                    self.remote_store.listen(target_data).await;
                }
            }
            Ok(())
        } else if !is_primary && state.is_primary != Some(false) {
            let mut active_targets = Vec::new();
            let target_ids: Vec<i32> = state.queries_by_target.keys().copied().collect();
            let was_primary = state.is_primary();
            for target_id in target_ids {
                if was_primary && state.target_listens_to_remote(target_id) {
                    self.remote_store.unlisten(target_id).await;
                }
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(&mut state, target_id, None).await;
                    self.local_store.release_target(target_id, true).await?;
                }
            }
            self.synchronize_views_and_raise_snapshots(&mut state, &active_targets, false)
                .await?;
            self.reset_limbo_documents(&mut state).await;
            state.is_primary = Some(false);
            self.publish_remote_keys(&state);
            drop(state);
            self.remote_store.apply_primary_state(false).await
        } else {
            Ok(())
        }
    }

    /// Applies a query state change another client reported for
    /// `target_id`. Only secondaries act on it.
    pub async fn apply_target_state(
        &self,
        target_id: i32,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.is_primary() {
            log::debug!("ignoring unexpected query state notification for target {target_id}");
            return Ok(());
        }
        let Some(first_query) = state
            .queries_by_target
            .get(&target_id)
            .and_then(|ids| ids.first())
            .and_then(|id| state.query_views.get(id))
            .map(|query_view| query_view.query.clone())
        else {
            return Ok(());
        };

        match target_state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.refreshed_documents(&state, target_id, &first_query).await?;
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    target_state == QueryTargetState::Current,
                    BytesValue::empty(),
                );
                self.emit_new_snaps_and_notify_local_store(&mut state, &changes, Some(&event))
                    .await
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true).await?;
                let error = error.unwrap_or_else(|| cancelled(format!("target {target_id} was rejected")));
                self.remove_and_cleanup_target(&mut state, target_id, Some(error)).await;
                Ok(())
            }
        }
    }

    /// Applies a mutation batch state change another client reported.
    pub async fn apply_batch_state(
        &self,
        batch_id: i32,
        batch_state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(batch) = self.local_store.lookup_mutation_batch(batch_id).await? else {
            log::debug!("cannot apply state for unknown mutation batch {batch_id}");
            return Ok(());
        };
        let mut documents = MutableDocumentMap::new();
        for mutation in &batch.mutations {
            let key = mutation.key().clone();
            let document = self.local_store.read_document(&key).await?;
            documents.insert(key, document);
        }

        match batch_state {
            MutationBatchState::Pending => {
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                let result = match (batch_state, error) {
                    (MutationBatchState::Rejected, Some(error)) => Err(error),
                    _ => Ok(()),
                };
                process_user_callback(&mut state, batch_id, result);
                trigger_pending_writes_callbacks(&mut state, batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&mut state, &documents, None)
            .await
    }

    /// Limbo documents with an active resolution target, keyed by document.
    pub async fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, i32> {
        self.state.lock().await.active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot, in FIFO order.
    pub async fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    /// Current view of `query`, if it is being listened to.
    pub async fn view_snapshot(&self, query: &Query) -> Option<ViewSnapshot> {
        self.state
            .lock()
            .await
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.view.compute_initial_snapshot())
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: i32,
        current: bool,
        resume_token: BytesValue,
        listens_to_remote: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized =
            TargetChange::synthesized_for_current_change(current && state.online_state != OnlineState::Offline, resume_token);
        let view_change = view.apply_changes(doc_changes, state.is_primary(), Some(&synthesized), false);

        let canonical_id = query.canonical_id();
        state.query_views.insert(
            canonical_id.clone(),
            QueryView {
                query,
                target_id,
                view,
                listens_to_remote,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(canonical_id);
        self.publish_remote_keys(state);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
            .await;

        match view_change.snapshot {
            Some(snapshot) => Ok(snapshot),
            None => fail("a new view always produces an initial snapshot"),
        }
    }

    async fn apply_remote_event_locked(&self, state: &mut SyncEngineState, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.document_change_count() <= 1,
                "Limbo resolution for single document contains multiple changes.",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received change for limbo target document without add.",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received remove for limbo target document without add.",
                );
                resolution.received_document = false;
            }
        }

        let changes = match self.local_store.apply_remote_event(event.clone()).await {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event))
            .await
    }

    /// Recomputes every view against `changes`, raises the resulting
    /// snapshots and reports view membership changes to the local store.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &MutableDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        if state.query_views.is_empty() {
            return Ok(());
        }
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) = self
                .apply_doc_changes(state, &canonical_id, changes, remote_event)
                .await?
            else {
                continue;
            };

            if state.is_primary() {
                let is_current = match &snapshot {
                    Some(snapshot) => Some(!snapshot.from_cache),
                    None => remote_event
                        .and_then(|event| event.target_changes.get(&target_id))
                        .map(|change| change.current),
                };
                if let Some(is_current) = is_current {
                    let query_state = if is_current {
                        QueryTargetState::Current
                    } else {
                        QueryTargetState::NotCurrent
                    };
                    self.shared_client_state.update_query_state(target_id, query_state, None);
                }
            }
            if let Some(snapshot) = snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }
        self.publish_remote_keys(state);
        if !snapshots.is_empty() {
            self.listener.on_watch_change(snapshots);
        }
        self.local_store.notify_local_view_changes(view_changes).await
    }

    async fn apply_doc_changes(
        &self,
        state: &mut SyncEngineState,
        canonical_id: &str,
        changes: &MutableDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<(i32, Option<ViewSnapshot>)>> {
        let limbo_resolution_enabled = state.is_primary();
        let Some(query_view) = state.query_views.get_mut(canonical_id) else {
            return Ok(None);
        };
        let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
        if doc_changes.needs_refill {
            // Documents left a limited view; re-run the query so documents
            // past the old limit can move in.
            let result = self.local_store.execute_query(&query_view.query, false).await?;
            doc_changes = query_view
                .view
                .compute_doc_changes(&result.documents, Some(doc_changes));
        }
        let target_id = query_view.target_id;
        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let target_is_pending_reset =
            remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
        let view_change = query_view.view.apply_changes(
            doc_changes,
            limbo_resolution_enabled,
            target_change,
            target_is_pending_reset,
        );
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
            .await;
        Ok(Some((target_id, view_change.snapshot)))
    }

    async fn update_tracked_limbos(&self, state: &mut SyncEngineState, target_id: i32, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.insert((key.clone(), target_id));
                    self.track_limbo_change(state, key).await;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    state.limbo_document_refs.remove(&(key.clone(), target_id));
                    if !state.is_limbo_referenced(&key) {
                        self.remove_limbo_target(state, &key).await;
                    }
                }
            }
        }
    }

    async fn track_limbo_change(&self, state: &mut SyncEngineState, key: DocumentKey) {
        if state.active_limbo_targets_by_key.contains_key(&key) || state.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state).await;
    }

    /// Starts limbo resolution targets while below the concurrency cap.
    async fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = state.limbo_target_ids.next();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state.active_limbo_targets_by_key.insert(key.clone(), target_id);
            self.publish_remote_keys(state);
            let target_data = TargetData::new(
                Target::for_document(&key),
                target_id,
                QueryPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            self.remote_store.listen(target_data).await;
        }
    }

    async fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = state.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.remote_store.unlisten(target_id).await;
        state.active_limbo_resolutions_by_target.remove(&target_id);
        self.publish_remote_keys(state);
        self.pump_enqueued_limbo_resolutions(state).await;
    }

    async fn remove_and_cleanup_target(&self, state: &mut SyncEngineState, target_id: i32, error: Option<FirestoreError>) {
        self.shared_client_state.remove_local_query_target(target_id);
        for canonical_id in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                continue;
            };
            if let Some(error) = &error {
                self.listener.on_watch_error(&query_view.query, error.clone());
            }
        }

        if state.is_primary() {
            let limbo_keys: Vec<DocumentKey> = state
                .limbo_document_refs
                .iter()
                .filter(|(_, referencing)| *referencing == target_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in limbo_keys {
                state.limbo_document_refs.remove(&(key.clone(), target_id));
                if !state.is_limbo_referenced(&key) {
                    self.remove_limbo_target(state, &key).await;
                }
            }
        }
        self.publish_remote_keys(state);
    }

    async fn reset_limbo_documents(&self, state: &mut SyncEngineState) {
        let limbo_targets: Vec<i32> = state.active_limbo_resolutions_by_target.keys().copied().collect();
        for target_id in limbo_targets {
            self.remote_store.unlisten(target_id).await;
        }
        state.limbo_document_refs.clear();
        state.active_limbo_resolutions_by_target.clear();
        state.active_limbo_targets_by_key.clear();
        state.enqueued_limbo_resolutions.clear();
    }

    /// Rebuilds the views of `targets` from persistence and raises the
    /// resulting snapshots. Returns the target data to listen to.
    async fn synchronize_views_and_raise_snapshots(
        &self,
        state: &mut SyncEngineState,
        targets: &[i32],
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut snapshots = Vec::new();
        for &target_id in targets {
            let canonical_ids = state.queries_by_target.get(&target_id).cloned().unwrap_or_default();
            let target_data = if let Some(first) = canonical_ids.first() {
                let Some(query) = state.query_views.get(first).map(|query_view| query_view.query.clone()) else {
                    continue;
                };
                let target_data = self.local_store.allocate_target(query.listen_target()).await?;
                for canonical_id in &canonical_ids {
                    let Some(query_view) = state.query_views.get_mut(canonical_id) else {
                        continue;
                    };
                    let query_result = self.local_store.execute_query(&query_view.query, true).await?;
                    let view_change = query_view.view.synchronize_with_persisted_state(query_result);
                    if transition_to_primary {
                        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
                            .await;
                    }
                    if let Some(snapshot) = view_change.snapshot {
                        snapshots.push(snapshot);
                    }
                }
                target_data
            } else {
                // A target another client started: rebuild a view for it
                // from its persisted definition.
                let Some(persisted) = self.local_store.get_target_data(target_id).await? else {
                    log::warn!("no persisted data for active target {target_id}");
                    continue;
                };
                let target_data = self.local_store.allocate_target(persisted.target.clone()).await?;
                self.initialize_view_and_compute_snapshot(
                    state,
                    Query::from_target(&persisted.target),
                    target_id,
                    false,
                    target_data.resume_token.clone(),
                    true,
                )
                .await?;
                target_data
            };
            active_queries.push(target_data);
        }
        if !snapshots.is_empty() {
            self.listener.on_watch_change(snapshots);
        }
        Ok(active_queries)
    }

    /// Local view of every document currently in or newly matching the
    /// first query of `target_id`, so removals are noticed too.
    async fn refreshed_documents(
        &self,
        state: &SyncEngineState,
        target_id: i32,
        query: &Query,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut documents = self.local_store.execute_query(query, false).await?.documents;
        let mut known = DocumentKeySet::new();
        for canonical_id in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(canonical_id) {
                let snapshot = query_view.view.compute_initial_snapshot();
                known.extend(snapshot.documents.keys().cloned());
            }
        }
        for key in known {
            if !documents.contains_key(&key) {
                let document = self.local_store.read_document(&key).await?;
                documents.insert(key, document);
            }
        }
        Ok(documents)
    }

    fn publish_remote_keys(&self, state: &SyncEngineState) {
        let mut keys: BTreeMap<i32, DocumentKeySet> = BTreeMap::new();
        for (target_id, resolution) in &state.active_limbo_resolutions_by_target {
            let mut limbo_keys = DocumentKeySet::new();
            if resolution.received_document {
                limbo_keys.insert(resolution.key.clone());
            }
            keys.insert(*target_id, limbo_keys);
        }
        for (target_id, canonical_ids) in &state.queries_by_target {
            let entry = keys.entry(*target_id).or_default();
            for canonical_id in canonical_ids {
                if let Some(query_view) = state.query_views.get(canonical_id) {
                    entry.extend(query_view.view.synced_documents().iter().cloned());
                }
            }
        }
        *self.remote_keys.lock().unwrap() = keys;
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.apply_remote_event_locked(&mut state, event).await
    }

    async fn reject_listen(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));

        let limbo_key = state
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());
        if let Some(key) = limbo_key {
            // Access to the document was lost: treat it as deleted.
            let mut event = RemoteEvent::default();
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event_locked(&mut state, event).await?;

            // The backend already dropped the target, so no unlisten.
            state.active_limbo_targets_by_key.remove(&key);
            state.active_limbo_resolutions_by_target.remove(&target_id);
            self.publish_remote_keys(&state);
            self.pump_enqueued_limbo_resolutions(&mut state).await;
            Ok(())
        } else {
            match self.local_store.release_target(target_id, false).await {
                Ok(()) => {
                    self.remove_and_cleanup_target(&mut state, target_id, Some(error))
                        .await;
                    Ok(())
                }
                Err(err) => ignore_if_primary_lease_loss(Err(err)),
            }
        }
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(result).await {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        process_user_callback(&mut state, batch_id, Ok(()));
        trigger_pending_writes_callbacks(&mut state, batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await
    }

    async fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let changes = match self.local_store.reject_batch(batch_id).await {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(Err(err)),
        };
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
        process_user_callback(&mut state, batch_id, Err(error));
        trigger_pending_writes_callbacks(&mut state, batch_id);
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet {
        self.remote_keys
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn local_view_changes(target_id: i32, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

fn process_user_callback(state: &mut SyncEngineState, batch_id: i32, result: FirestoreResult<()>) {
    let user_key = state.current_user.to_key();
    let sender = state
        .mutation_user_callbacks
        .get_mut(&user_key)
        .and_then(|callbacks| callbacks.remove(&batch_id));
    if let Some(sender) = sender {
        // The caller may have stopped waiting.
        let _ = sender.send(result);
    }
}

fn trigger_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: i32) {
    for sender in state.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
        let _ = sender.send(Ok(()));
    }
}

fn reject_pending_writes_callbacks(state: &mut SyncEngineState, message: &str) {
    for (_, senders) in std::mem::take(&mut state.pending_writes_callbacks) {
        for sender in senders {
            let _ = sender.send(Err(cancelled(message)));
        }
    }
}
