use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::OnceCell;

use crate::firestore::error::{
    is_permanent_error, is_permanent_write_error, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DatabaseId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::datastore::{Datastore, WatchRequest, WatchResponse, WriteRequest, WriteResponse};
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{
    PersistentStream, StreamListener, StreamOpener, StreamTimers,
};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::util::async_queue::{AsyncQueue, TimerId};
use crate::firestore::value::BytesValue;
use crate::util::assert::{fail, hard_assert};

/// Batches sent on the write stream without an acknowledgement yet.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams closed. The network is used
/// only while none applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// Another tab owns the network.
    IsSecondary,
    CredentialChange,
    Shutdown,
}

type SyncerCell = Arc<OnceCell<Weak<dyn RemoteSyncer>>>;

fn upgrade_syncer(cell: &SyncerCell) -> Option<Arc<dyn RemoteSyncer>> {
    cell.get().and_then(Weak::upgrade)
}

/// What the watch aggregator needs to know about listened targets.
struct ListenTargetMetadata {
    database_id: DatabaseId,
    listen_targets: Arc<StdMutex<BTreeMap<i32, TargetData>>>,
    syncer: SyncerCell,
}

impl TargetMetadataProvider for ListenTargetMetadata {
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet {
        upgrade_syncer(&self.syncer)
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        self.listen_targets.lock().unwrap().get(&target_id).cloned()
    }

    fn database_id(&self) -> DatabaseId {
        self.database_id.clone()
    }
}

struct RemoteStoreState {
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) and not yet acknowledged, in
    /// batch id order.
    write_pipeline: VecDeque<MutationBatch>,
    write_handshake_complete: bool,
    last_stream_token: BytesValue,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Owns the listen and write streams and keeps them in sync with what the
/// sync engine wants: every listened target is (re)sent on each new listen
/// stream, and pending mutation batches are pipelined on the write stream.
///
/// All methods must run on the client's async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    local_store: Arc<LocalStore>,
    syncer: SyncerCell,
    listen_targets: Arc<StdMutex<BTreeMap<i32, TargetData>>>,
    metadata: Arc<dyn TargetMetadataProvider>,
    online_state: OnlineStateTracker,
    watch_stream: PersistentStream<WatchRequest, WatchResponse>,
    write_stream: PersistentStream<WriteRequest, WriteResponse>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn Datastore>,
        queue: AsyncQueue,
        online_state_handler: OnlineStateHandler,
    ) -> Self {
        let syncer: SyncerCell = Arc::new(OnceCell::new());
        let listen_targets = Arc::new(StdMutex::new(BTreeMap::new()));
        let metadata: Arc<dyn TargetMetadataProvider> = Arc::new(ListenTargetMetadata {
            database_id,
            listen_targets: Arc::clone(&listen_targets),
            syncer: Arc::clone(&syncer),
        });

        let watch_opener: StreamOpener<WatchRequest, WatchResponse> = {
            let datastore = Arc::clone(&datastore);
            Arc::new(move || {
                let datastore = Arc::clone(&datastore);
                async move { datastore.open_watch_stream().await }.boxed()
            })
        };
        let write_opener: StreamOpener<WriteRequest, WriteResponse> = Arc::new(move || {
            let datastore = Arc::clone(&datastore);
            async move { datastore.open_write_stream().await }.boxed()
        });

        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_listener: Weak<dyn StreamListener<WatchResponse>> = weak.clone();
            let write_listener: Weak<dyn StreamListener<WriteResponse>> = weak.clone();
            RemoteStoreInner {
                local_store,
                syncer,
                listen_targets,
                metadata,
                online_state: OnlineStateTracker::new(queue.clone(), online_state_handler),
                watch_stream: PersistentStream::new(
                    "watch",
                    queue.clone(),
                    watch_opener,
                    StreamTimers {
                        idle: TimerId::ListenStreamIdle,
                        backoff: TimerId::ListenStreamConnectionBackoff,
                    },
                    watch_listener,
                ),
                write_stream: PersistentStream::new(
                    "write",
                    queue,
                    write_opener,
                    StreamTimers {
                        idle: TimerId::WriteStreamIdle,
                        backoff: TimerId::WriteStreamConnectionBackoff,
                    },
                    write_listener,
                ),
                state: Mutex::new(RemoteStoreState {
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    write_handshake_complete: false,
                    last_stream_token: BytesValue::empty(),
                    offline_causes: BTreeSet::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Connects the sync engine. Must be called once, before the network is
    /// enabled.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        if self.inner.syncer.set(syncer).is_err() {
            log::warn!("remote syncer already set");
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.can_use_network().await
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network).
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Closes both streams until [`enable_network`](Self::enable_network).
    /// Unacknowledged writes are resent afterwards.
    pub async fn disable_network(&self) {
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Offline);
    }

    pub async fn shutdown(&self) {
        log::debug!("remote store shutting down");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Unknown);
    }

    /// Starts listening to `target_data` unless its target id is already
    /// listened to.
    pub async fn listen(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        {
            let mut targets = self.inner.listen_targets.lock().unwrap();
            if targets.contains_key(&target_id) {
                return;
            }
            targets.insert(target_id, target_data.clone());
        }
        if self.inner.should_start_watch_stream().await {
            self.inner.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(target_data).await;
        }
    }

    pub async fn unlisten(&self, target_id: i32) {
        let now_empty = {
            let mut targets = self.inner.listen_targets.lock().unwrap();
            hard_assert(
                targets.remove(&target_id).is_some(),
                format!("unlisten called on target {target_id} that is not being listened to"),
            );
            targets.is_empty()
        };
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id).await;
        }
        if now_empty {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if self.inner.can_use_network().await {
                // Nothing to listen to; the stream is no longer the source of
                // truth about connectivity.
                self.inner.online_state.set(OnlineState::Unknown);
            }
        }
    }

    /// Pulls pending batches from the mutation queue into the write
    /// pipeline and starts the write stream if needed.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Closes the streams while `apply` switches the local state to a new
    /// user, then reconnects.
    pub async fn handle_credential_change<F, Fut>(&self, apply: F) -> FirestoreResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FirestoreResult<()>>,
    {
        log::debug!("remote store restarting streams for a new user");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Unknown);
        let result = apply().await;
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await?;
        result
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await
        } else {
            self.inner.state.lock().await.offline_causes.insert(OfflineCause::IsSecondary);
            self.inner.disable_network_internal().await;
            self.inner.online_state.set(OnlineState::Unknown);
            Ok(())
        }
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        upgrade_syncer(&self.syncer).ok_or_else(|| unavailable("The sync engine is no longer running"))
    }

    async fn can_use_network(&self) -> bool {
        self.state.lock().await.offline_causes.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        self.watch_stream.inhibit_backoff();
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
        self.write_stream.inhibit_backoff();
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.watch_stream.stop().await;
        self.state.lock().await.watch_aggregator = None;

        self.write_stream.stop().await;
        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
    }

    // Watch stream

    async fn should_start_watch_stream(&self) -> bool {
        self.can_use_network().await
            && !self.watch_stream.is_started()
            && !self.listen_targets.lock().unwrap().is_empty()
    }

    async fn start_watch_stream(&self) {
        self.state.lock().await.watch_aggregator = Some(WatchChangeAggregator::new(Arc::clone(&self.metadata)));
        self.watch_stream.start();
        self.online_state.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let target_data = if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min() {
            let expected_count = self.metadata.get_remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        self.watch_stream.send(WatchRequest::Listen(target_data)).await;
    }

    async fn send_unwatch_request(&self, target_id: i32) {
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.send(WatchRequest::Unlisten(target_id)).await;
    }

    async fn on_watch_stream_open(&self) {
        let targets: Vec<TargetData> = self.listen_targets.lock().unwrap().values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await;
        }
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        self.state.lock().await.watch_aggregator = None;
        if self.should_start_watch_stream().await {
            let error = error.unwrap_or_else(|| unavailable("The watch stream closed unexpectedly"));
            self.online_state.handle_watch_stream_failure(&error);
            self.start_watch_stream().await;
        } else {
            // Stopped deliberately, or nothing left to listen to.
            self.online_state.set(OnlineState::Unknown);
        }
    }

    async fn on_watch_stream_change(&self, response: WatchResponse) -> FirestoreResult<()> {
        self.online_state.set(OnlineState::Online);

        if let WatchChange::TargetChange(change) = &response.change {
            if change.state == TargetChangeState::Removed && change.cause.is_some() {
                return self.handle_target_error(change).await;
            }
        }

        {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.handle_watch_change(response.change);
        }

        if !response.snapshot_version.is_min() {
            let last_remote_version = self.local_store.get_last_remote_snapshot_version().await?;
            if response.snapshot_version >= last_remote_version {
                self.raise_watch_snapshot(response.snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Turns the aggregated changes into a remote event, records the new
    /// resume tokens and re-listens to targets whose results went stale.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let event = {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        let mut relistens = Vec::new();
        {
            let mut targets = self.listen_targets.lock().unwrap();
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get(target_id) {
                    let updated = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                    targets.insert(*target_id, updated);
                }
            }
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = targets.get(target_id).cloned() else {
                    continue;
                };
                // Resume from scratch so the backend resends the full result.
                targets.insert(
                    *target_id,
                    target_data.with_resume_token(BytesValue::empty(), target_data.snapshot_version),
                );
                relistens.push(TargetData::new(
                    target_data.target,
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
        }
        for target_data in relistens {
            self.send_unwatch_request(target_data.target_id).await;
            self.send_watch_request(target_data).await;
        }

        self.syncer()?.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        let syncer = self.syncer()?;
        for target_id in &change.target_ids {
            let Some(target_data) = self.listen_targets.lock().unwrap().get(target_id).cloned() else {
                continue;
            };
            if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            if !is_permanent_error(cause.code) {
                log::debug!("target {target_id} dropped by the backend ({cause}), listening again");
                self.send_watch_request(target_data).await;
                continue;
            }
            log::debug!("target {target_id} rejected by the backend: {cause}");
            syncer.reject_listen(*target_id, cause.clone()).await?;
            self.listen_targets.lock().unwrap().remove(target_id);
        }
        Ok(())
    }

    // Write stream

    async fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    async fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .state
            .lock()
            .await
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline().await {
            match self.local_store.next_mutation_batch(last_batch_id).await? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch).await;
                }
                None => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        let request = {
            let mut state = self.state.lock().await;
            let request = (self.write_stream.is_open() && state.write_handshake_complete).then(|| {
                WriteRequest::Mutations {
                    stream_token: state.last_stream_token.clone(),
                    mutations: batch.mutations.clone(),
                }
            });
            state.write_pipeline.push_back(batch);
            request
        };
        if let Some(request) = request {
            self.write_stream.send(request).await;
        }
    }

    async fn on_write_stream_open(&self) {
        self.state.lock().await.write_handshake_complete = false;
        self.write_stream.send(WriteRequest::Handshake).await;
    }

    async fn on_write_stream_message(&self, response: WriteResponse) -> FirestoreResult<()> {
        let handshake_complete = {
            let mut state = self.state.lock().await;
            state.last_stream_token = response.stream_token.clone();
            state.write_handshake_complete
        };
        if handshake_complete {
            self.on_mutation_result(response).await
        } else {
            self.on_write_handshake_complete(response.stream_token).await
        }
    }

    async fn on_write_handshake_complete(&self, stream_token: BytesValue) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(stream_token.clone()).await?;
        let requests: Vec<WriteRequest> = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = true;
            state
                .write_pipeline
                .iter()
                .map(|batch| WriteRequest::Mutations {
                    stream_token: stream_token.clone(),
                    mutations: batch.mutations.clone(),
                })
                .collect()
        };
        for request in requests {
            self.write_stream.send(request).await;
        }
        Ok(())
    }

    async fn on_mutation_result(&self, response: WriteResponse) -> FirestoreResult<()> {
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            fail("Got a mutation result with an empty write pipeline");
        };
        let result = MutationBatchResult::from(batch, response.commit_version, response.results, response.stream_token);
        self.syncer()?.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            let (has_pending, handshake_complete) = {
                let state = self.state.lock().await;
                (!state.write_pipeline.is_empty(), state.write_handshake_complete)
            };
            if has_pending {
                if handshake_complete {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(error).await?;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_error(error.code) {
            return Ok(());
        }
        log::debug!("write stream handshake failed permanently, resetting the stream token: {error}");
        self.state.lock().await.last_stream_token = BytesValue::empty();
        self.local_store.set_last_stream_token(BytesValue::empty()).await
    }

    /// Drops the head batch when the backend rejected it for good; other
    /// errors leave it to be resent on the next stream.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Ok(());
        };
        log::warn!("write batch {} rejected by the backend: {error}", batch.batch_id);
        // The failure was the batch's fault, not the connection's.
        self.write_stream.inhibit_backoff();
        self.syncer()?.reject_failed_write(batch.batch_id, error).await?;
        self.fill_write_pipeline().await
    }
}

#[async_trait]
impl StreamListener<WatchResponse> for RemoteStoreInner {
    async fn on_open(&self) {
        self.on_watch_stream_open().await;
    }

    async fn on_message(&self, message: WatchResponse) -> FirestoreResult<()> {
        self.on_watch_stream_change(message).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        self.on_watch_stream_close(error).await;
    }
}

#[async_trait]
impl StreamListener<WriteResponse> for RemoteStoreInner {
    async fn on_open(&self) {
        self.on_write_stream_open().await;
    }

    async fn on_message(&self, message: WriteResponse) -> FirestoreResult<()> {
        self.on_write_stream_message(message).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Err(error) = self.on_write_stream_close(error).await {
            log::warn!("failed to handle write stream close: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::settings::IndexAutoCreationSettings;
    use crate::firestore::core::user::User;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::persistence::Persistence;
    use crate::firestore::local::target_data::QueryPurpose;
    use crate::firestore::model::{DocumentKey, FieldPath, Mutation, ResourcePath};
    use crate::firestore::remote::datastore::MockDatastore;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::platform::runtime;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        events: Vec<RemoteEvent>,
        acknowledged: Vec<i32>,
        rejected_writes: Vec<(i32, FirestoreErrorCode)>,
        rejected_listens: Vec<i32>,
    }

    struct RecordingSyncer {
        local_store: Arc<LocalStore>,
        recorded: StdMutex<Recorded>,
    }

    #[async_trait]
    impl RemoteSyncer for RecordingSyncer {
        async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().events.push(event);
            Ok(())
        }

        async fn reject_listen(&self, target_id: i32, _error: FirestoreError) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().rejected_listens.push(target_id);
            Ok(())
        }

        async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().acknowledged.push(result.batch.batch_id);
            self.local_store.acknowledge_batch(result).await?;
            Ok(())
        }

        async fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
            self.recorded.lock().unwrap().rejected_writes.push((batch_id, error.code));
            self.local_store.reject_batch(batch_id).await?;
            Ok(())
        }

        fn get_remote_keys_for_target(&self, _target_id: i32) -> DocumentKeySet {
            DocumentKeySet::new()
        }
    }

    struct Harness {
        queue: AsyncQueue,
        datastore: MockDatastore,
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        syncer: Arc<RecordingSyncer>,
        online_states: Arc<StdMutex<Vec<OnlineState>>>,
    }

    impl Harness {
        async fn new() -> Self {
            let queue = AsyncQueue::new();
            let database_id = DatabaseId::default("p");
            let datastore = MockDatastore::new(database_id.clone());
            let persistence = Persistence::memory("client").unwrap();
            let local_store = Arc::new(LocalStore::new(
                persistence,
                User::unauthenticated(),
                IndexAutoCreationSettings::default(),
            ));
            local_store.start().await.unwrap();
            let online_states = Arc::new(StdMutex::new(Vec::new()));
            let sink = Arc::clone(&online_states);
            let remote_store = RemoteStore::new(
                database_id,
                Arc::clone(&local_store),
                Arc::new(datastore.clone()),
                queue.clone(),
                Arc::new(move |state| sink.lock().unwrap().push(state)),
            );
            let syncer = Arc::new(RecordingSyncer {
                local_store: Arc::clone(&local_store),
                recorded: StdMutex::new(Recorded::default()),
            });
            let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&(Arc::clone(&syncer) as Arc<dyn RemoteSyncer>));
            remote_store.set_syncer(weak);
            Self {
                queue,
                datastore,
                local_store,
                remote_store,
                syncer,
                online_states,
            }
        }

        async fn settle(&self) {
            for _ in 0..8 {
                runtime::sleep(Duration::from_millis(10)).await;
                self.queue.drain().await.unwrap();
            }
        }

        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(RemoteStore) -> Fut,
            Fut: Future<Output = ()> + Send + 'static,
        {
            let future = op(self.remote_store.clone());
            self.queue
                .enqueue(async move {
                    future.await;
                    Ok(())
                })
                .await
                .unwrap();
            self.settle().await;
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: &str) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_segment("name"), FirestoreValue::from(value));
        map
    }

    fn rooms_target(target_id: i32) -> TargetData {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).listen_target();
        TargetData::new(target, target_id, QueryPurpose::Listen, 1)
    }

    #[tokio::test]
    async fn listen_raises_remote_events() {
        let harness = Harness::new().await;
        harness.datastore.set_document(key("rooms/a"), data("A"));

        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
                store.listen(rooms_target(2)).await;
            })
            .await;

        let recorded = harness.syncer.recorded.lock().unwrap();
        let event = recorded.events.last().expect("remote event");
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(event.document_updates.contains_key(&key("rooms/a")));
        assert_eq!(harness.remote_store.online_state(), OnlineState::Online);
        assert_eq!(harness.datastore.active_targets(), BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn pending_writes_are_sent_and_acknowledged() {
        let harness = Harness::new().await;
        let first = harness
            .local_store
            .local_write(vec![Mutation::set(key("rooms/a"), data("A"))])
            .await
            .unwrap();
        let second = harness
            .local_store
            .local_write(vec![Mutation::set(key("rooms/b"), data("B"))])
            .await
            .unwrap();

        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
            })
            .await;

        assert_eq!(
            harness.syncer.recorded.lock().unwrap().acknowledged,
            vec![first.batch_id, second.batch_id]
        );
        assert_eq!(harness.datastore.committed_mutations().len(), 2);
        assert!(harness.datastore.document(&key("rooms/b")).is_some());
    }

    #[tokio::test]
    async fn permanent_write_errors_reject_the_batch() {
        let harness = Harness::new().await;
        harness
            .datastore
            .fail_next_write(permission_denied("Missing or insufficient permissions."));
        let failed = harness
            .local_store
            .local_write(vec![Mutation::set(key("rooms/a"), data("A"))])
            .await
            .unwrap();
        let succeeding = harness
            .local_store
            .local_write(vec![Mutation::set(key("rooms/b"), data("B"))])
            .await
            .unwrap();

        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
            })
            .await;

        let recorded = harness.syncer.recorded.lock().unwrap();
        assert_eq!(
            recorded.rejected_writes,
            vec![(failed.batch_id, FirestoreErrorCode::PermissionDenied)]
        );
        assert_eq!(recorded.acknowledged, vec![succeeding.batch_id]);
        assert!(harness.datastore.document(&key("rooms/a")).is_none());
    }

    #[tokio::test]
    async fn rejected_targets_are_dropped() {
        let harness = Harness::new().await;
        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
                store.listen(rooms_target(2)).await;
            })
            .await;

        harness.datastore.push_watch_response(WatchResponse::new(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Removed, vec![2])
                .with_cause(permission_denied("denied")),
        )));
        harness.settle().await;

        assert_eq!(harness.syncer.recorded.lock().unwrap().rejected_listens, vec![2]);
        // A second listen for the same id is accepted again.
        harness
            .run(|store| async move {
                store.listen(rooms_target(2)).await;
            })
            .await;
        assert!(harness.datastore.active_targets().contains(&2));
    }

    #[tokio::test]
    async fn transient_target_errors_listen_again() {
        let harness = Harness::new().await;
        harness.datastore.set_document(key("rooms/a"), data("a"));
        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
                store.listen(rooms_target(2)).await;
            })
            .await;
        harness.settle().await;
        let events_before = harness.syncer.recorded.lock().unwrap().events.len();

        harness.datastore.push_watch_response(WatchResponse::new(WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Removed, vec![2])
                .with_cause(unavailable("backend restarting")),
        )));
        harness.settle().await;

        let recorded = harness.syncer.recorded.lock().unwrap();
        assert!(recorded.rejected_listens.is_empty());
        assert!(recorded.events.len() > events_before);
        assert!(recorded.events.last().unwrap().target_changes.contains_key(&2));
        drop(recorded);
        assert!(harness.datastore.active_targets().contains(&2));
    }

    #[tokio::test]
    async fn disabling_the_network_reports_offline() {
        let harness = Harness::new().await;
        harness
            .run(|store| async move {
                store.enable_network().await.unwrap();
                store.listen(rooms_target(2)).await;
            })
            .await;

        harness
            .run(|store| async move {
                store.disable_network().await;
            })
            .await;

        assert_eq!(harness.remote_store.online_state(), OnlineState::Offline);
        assert!(harness.datastore.active_targets().is_empty());
        assert_eq!(
            harness.online_states.lock().unwrap().last(),
            Some(&OnlineState::Offline)
        );
        assert!(!harness.remote_store.can_use_network().await);
    }
}
