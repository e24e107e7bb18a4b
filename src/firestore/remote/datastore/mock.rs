use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::target::Target;
use crate::firestore::error::{
    already_exists, failed_precondition, not_found, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, Mutation, MutationKind, MutationResult,
    Precondition, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::bloom_filter::build_payload;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilter, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchTargetChange,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue};

use super::{
    CommitResponse, Datastore, StreamHandle, WatchRequest, WatchResponse, WatchStreamHandle, WriteRequest,
    WriteResponse, WriteStreamHandle,
};

/// Commit versions advance by this many microseconds.
const VERSION_STEP_MICROS: i64 = 1_000;

/// In-process backend for tests and offline embedding.
///
/// Holds the authoritative documents, applies commits atomically, and
/// drives open listen streams the way the real backend does: each listen is
/// answered with its current results followed by a global snapshot, and
/// every later commit pushes the affected documents to matching targets.
#[derive(Clone)]
pub struct MockDatastore {
    inner: Arc<MockInner>,
}

struct MockInner {
    database_id: DatabaseId,
    state: StdMutex<MockState>,
}

struct MockState {
    documents: BTreeMap<DocumentKey, MutableDocument>,
    version_micros: i64,
    network_available: bool,
    next_stream_token: u64,
    write_failures: VecDeque<FirestoreError>,
    committed: Vec<Vec<Mutation>>,
    watch_streams: Vec<Weak<MockWatchStream>>,
    write_streams: Vec<Weak<MockWriteStream>>,
    watch_stream_count: usize,
    /// Single-document listens waiting for `release_document_listens`.
    held_document_listens: Option<Vec<TargetData>>,
}

impl MockDatastore {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            inner: Arc::new(MockInner {
                database_id,
                state: StdMutex::new(MockState {
                    documents: BTreeMap::new(),
                    version_micros: 1_000_000,
                    network_available: true,
                    next_stream_token: 1,
                    write_failures: VecDeque::new(),
                    committed: Vec::new(),
                    watch_streams: Vec::new(),
                    write_streams: Vec::new(),
                    watch_stream_count: 0,
                    held_document_listens: None,
                }),
            }),
        }
    }

    /// Writes a document as another client would and notifies listeners.
    pub fn set_document(&self, key: DocumentKey, data: MapValue) {
        let mut state = self.inner.state.lock().unwrap();
        let version = state.advance_version();
        state
            .documents
            .insert(key.clone(), MutableDocument::new_found_document(key.clone(), version, data));
        self.inner.notify_watchers(&state, &BTreeSet::from([key]), version);
    }

    pub fn delete_document(&self, key: &DocumentKey) {
        let mut state = self.inner.state.lock().unwrap();
        let version = state.advance_version();
        state.documents.remove(key);
        self.inner.notify_watchers(&state, &BTreeSet::from([key.clone()]), version);
    }

    /// Deletes documents without telling listeners, as when deletes happen
    /// while the client was disconnected and its resume token is stale.
    pub fn delete_documents_silently(&self, keys: &[DocumentKey]) {
        let mut state = self.inner.state.lock().unwrap();
        state.advance_version();
        for key in keys {
            state.documents.remove(key);
        }
    }

    /// Sends an existence filter for `target_id` carrying the current
    /// server-side count and, with `hash_count > 0`, a Bloom filter of the
    /// matching document names.
    pub fn send_existence_filter(&self, target_id: i32, bitmap_len: usize, hash_count: u32) {
        let state = self.inner.state.lock().unwrap();
        let version = SnapshotVersion::from_micros(state.version_micros);
        for stream in state.live_watch_streams() {
            let mut targets = stream.targets.lock().unwrap();
            let Some(listened) = targets.get_mut(&target_id) else {
                continue;
            };
            let matching = matching_documents(&state.documents, &listened.target);
            let names: Vec<String> = matching
                .iter()
                .map(|doc| self.inner.database_id.document_name(doc.key()))
                .collect();
            listened.keys = matching.iter().map(|doc| doc.key().clone()).collect();
            let existence_filter = if hash_count > 0 {
                ExistenceFilter::with_bloom_filter(
                    names.len() as i32,
                    build_payload(&names, bitmap_len, hash_count),
                )
            } else {
                ExistenceFilter::new(names.len() as i32)
            };
            stream.push(WatchResponse::new(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id,
                existence_filter,
            })));
            stream.push(global_snapshot(version));
        }
    }

    /// Pushes `response` to every open listen stream.
    pub fn push_watch_response(&self, response: WatchResponse) {
        let state = self.inner.state.lock().unwrap();
        for stream in state.live_watch_streams() {
            stream.push(response.clone());
        }
    }

    /// Leaves listens for single documents unanswered until
    /// `release_document_listens` is called.
    pub fn hold_document_listens(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.held_document_listens.get_or_insert_with(Vec::new);
    }

    /// Answers the held document listens, oldest first, and stops holding.
    pub fn release_document_listens(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let held = state.held_document_listens.take().unwrap_or_default();
        for stream in state.live_watch_streams() {
            for target_data in &held {
                answer_listen(&state, &stream, target_data.clone());
            }
        }
    }

    /// Makes the next write (streamed or committed) fail with `error`.
    pub fn fail_next_write(&self, error: FirestoreError) {
        self.inner.state.lock().unwrap().write_failures.push_back(error);
    }

    /// Simulates losing or regaining connectivity. Open streams fail with
    /// `Unavailable` when the network goes away.
    pub fn set_network_available(&self, available: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.network_available = available;
        if available {
            return;
        }
        for stream in state.live_watch_streams() {
            stream.fail(unavailable("The mock backend is unreachable"));
        }
        for stream in state.live_write_streams() {
            stream.fail(unavailable("The mock backend is unreachable"));
        }
        state.watch_streams.clear();
        state.write_streams.clear();
    }

    pub fn document(&self, key: &DocumentKey) -> Option<MutableDocument> {
        self.inner.state.lock().unwrap().documents.get(key).cloned()
    }

    /// Every batch of mutations the backend accepted, in commit order.
    pub fn committed_mutations(&self) -> Vec<Vec<Mutation>> {
        self.inner.state.lock().unwrap().committed.clone()
    }

    /// Targets listened to on any open listen stream.
    pub fn active_targets(&self) -> BTreeSet<i32> {
        let state = self.inner.state.lock().unwrap();
        state
            .live_watch_streams()
            .iter()
            .flat_map(|stream| stream.targets.lock().unwrap().keys().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Number of listen streams opened so far.
    pub fn watch_stream_count(&self) -> usize {
        self.inner.state.lock().unwrap().watch_stream_count
    }
}

impl MockState {
    fn advance_version(&mut self) -> SnapshotVersion {
        self.version_micros += VERSION_STEP_MICROS;
        SnapshotVersion::from_micros(self.version_micros)
    }

    fn next_stream_token(&mut self) -> BytesValue {
        let token = self.next_stream_token;
        self.next_stream_token += 1;
        BytesValue::new(token.to_be_bytes().to_vec())
    }

    fn live_watch_streams(&self) -> Vec<Arc<MockWatchStream>> {
        self.watch_streams.iter().filter_map(Weak::upgrade).collect()
    }

    fn live_write_streams(&self) -> Vec<Arc<MockWriteStream>> {
        self.write_streams.iter().filter_map(Weak::upgrade).collect()
    }

    fn ensure_available(&self) -> FirestoreResult<()> {
        if self.network_available {
            Ok(())
        } else {
            Err(unavailable("The mock backend is unreachable"))
        }
    }
}

impl MockInner {
    fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse> {
        let mut state = self.state.lock().unwrap();
        state.ensure_available()?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }

        let commit_version = SnapshotVersion::from_micros(state.version_micros + VERSION_STEP_MICROS);
        let commit_time = commit_version.timestamp();
        let mut documents = state.documents.clone();
        let mut results = Vec::with_capacity(mutations.len());
        let mut changed = BTreeSet::new();
        for mutation in &mutations {
            let key = mutation.key().clone();
            let existing = documents
                .get(&key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            let precondition = mutation.precondition();
            if !precondition.is_valid_for(&existing) {
                return Err(precondition_error(&precondition, &key));
            }
            let result = MutationResult::new(
                commit_version,
                server_transform_results(mutation, &existing, commit_time),
            );
            if matches!(mutation.kind(), MutationKind::Verify) {
                results.push(result);
                continue;
            }
            let mut updated = existing;
            mutation.apply_to_remote_document(&mut updated, &result);
            if updated.is_found_document() {
                let stored = MutableDocument::new_found_document(key.clone(), commit_version, updated.data().clone());
                documents.insert(key.clone(), stored);
            } else {
                documents.remove(&key);
            }
            changed.insert(key);
            results.push(result);
        }

        state.version_micros = commit_version.to_micros();
        state.documents = documents;
        state.committed.push(mutations);
        self.notify_watchers(&state, &changed, commit_version);
        Ok(CommitResponse {
            commit_version,
            results,
        })
    }

    fn notify_watchers(&self, state: &MockState, changed: &BTreeSet<DocumentKey>, version: SnapshotVersion) {
        for stream in state.live_watch_streams() {
            let mut targets = stream.targets.lock().unwrap();
            if targets.is_empty() {
                continue;
            }
            for (target_id, listened) in targets.iter_mut() {
                for key in changed {
                    let current = state.documents.get(key);
                    match current {
                        Some(document) if listened.target.matches(document) => {
                            listened.keys.insert(key.clone());
                            stream.push(WatchResponse::new(WatchChange::DocumentChange(
                                DocumentWatchChange::updated(document.clone(), vec![*target_id], Vec::new()),
                            )));
                        }
                        Some(_) => {
                            if listened.keys.remove(key) {
                                stream.push(WatchResponse::new(WatchChange::DocumentChange(
                                    DocumentWatchChange::removed(key.clone(), vec![*target_id]),
                                )));
                            }
                        }
                        None => {
                            if listened.keys.remove(key) {
                                stream.push(WatchResponse::new(WatchChange::DocumentChange(
                                    DocumentWatchChange::deleted(key.clone(), version, vec![*target_id]),
                                )));
                            }
                        }
                    }
                }
            }
            stream.push(global_snapshot(version));
        }
    }

    fn handle_watch_request(&self, stream: &MockWatchStream, request: WatchRequest) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_available()?;
        match request {
            WatchRequest::Listen(target_data) => {
                if let Some(held) = state.held_document_listens.as_mut() {
                    if target_data.target.is_document_target() {
                        held.push(target_data);
                        return Ok(());
                    }
                }
                answer_listen(&state, stream, target_data);
            }
            WatchRequest::Unlisten(target_id) => {
                if let Some(held) = state.held_document_listens.as_mut() {
                    held.retain(|target_data| target_data.target_id != target_id);
                }
                stream.targets.lock().unwrap().remove(&target_id);
                stream.push(WatchResponse::new(WatchChange::TargetChange(WatchTargetChange::new(
                    TargetChangeState::Removed,
                    vec![target_id],
                ))));
            }
        }
        Ok(())
    }
}

/// Sends a listen's current results followed by a global snapshot.
fn answer_listen(state: &MockState, stream: &MockWatchStream, target_data: TargetData) {
    let target_id = target_data.target_id;
    let matching = matching_documents(&state.documents, &target_data.target);
    stream.push(WatchResponse::new(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Added,
        vec![target_id],
    ))));
    for document in &matching {
        stream.push(WatchResponse::new(WatchChange::DocumentChange(
            DocumentWatchChange::updated(document.clone(), vec![target_id], Vec::new()),
        )));
    }
    stream.targets.lock().unwrap().insert(
        target_id,
        ListenedTarget {
            target: target_data.target,
            keys: matching.iter().map(|doc| doc.key().clone()).collect(),
        },
    );
    let version = SnapshotVersion::from_micros(state.version_micros);
    stream.push(WatchResponse::new(WatchChange::TargetChange(
        WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
            .with_resume_token(resume_token(version)),
    )));
    stream.push(global_snapshot(version));
}

#[async_trait]
impl Datastore for MockDatastore {
    async fn open_watch_stream(&self) -> FirestoreResult<WatchStreamHandle> {
        let mut state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        let (sender, receiver) = async_channel::unbounded();
        let stream = Arc::new(MockWatchStream {
            server: Arc::downgrade(&self.inner),
            sender,
            receiver,
            targets: StdMutex::new(BTreeMap::new()),
        });
        state.watch_streams.retain(|stream| stream.strong_count() > 0);
        state.watch_streams.push(Arc::downgrade(&stream));
        state.watch_stream_count += 1;
        Ok(stream)
    }

    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamHandle> {
        let mut state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        let (sender, receiver) = async_channel::unbounded();
        let stream = Arc::new(MockWriteStream {
            server: Arc::downgrade(&self.inner),
            sender,
            receiver,
        });
        state.write_streams.retain(|stream| stream.strong_count() > 0);
        state.write_streams.push(Arc::downgrade(&stream));
        Ok(stream)
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse> {
        self.inner.commit(mutations)
    }

    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        let state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        let read_version = SnapshotVersion::from_micros(state.version_micros);
        Ok(keys
            .iter()
            .map(|key| {
                state
                    .documents
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| MutableDocument::new_no_document(key.clone(), read_version))
            })
            .collect())
    }

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>> {
        let state = self.inner.state.lock().unwrap();
        state.ensure_available()?;
        let mut results = matching_documents(&state.documents, &query.to_target());
        if query.limit_type() == LimitType::Last {
            results.reverse();
        }
        Ok(results)
    }

    async fn run_aggregation_query(&self, query: &Query) -> FirestoreResult<i64> {
        Ok(self.run_query(query).await?.len() as i64)
    }
}

struct ListenedTarget {
    target: Target,
    /// Documents the client was told are in the target.
    keys: DocumentKeySet,
}

struct MockWatchStream {
    server: Weak<MockInner>,
    sender: async_channel::Sender<FirestoreResult<WatchResponse>>,
    receiver: async_channel::Receiver<FirestoreResult<WatchResponse>>,
    targets: StdMutex<BTreeMap<i32, ListenedTarget>>,
}

impl MockWatchStream {
    fn push(&self, response: WatchResponse) {
        let _ = self.sender.try_send(Ok(response));
    }

    fn fail(&self, error: FirestoreError) {
        let _ = self.sender.try_send(Err(error));
        self.sender.close();
    }
}

#[async_trait]
impl StreamHandle<WatchRequest, WatchResponse> for MockWatchStream {
    async fn send(&self, request: WatchRequest) -> FirestoreResult<()> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| unavailable("The mock backend is gone"))?;
        server.handle_watch_request(self, request)
    }

    async fn next(&self) -> Option<FirestoreResult<WatchResponse>> {
        self.receiver.recv().await.ok()
    }

    fn close(&self) {
        self.sender.close();
    }
}

struct MockWriteStream {
    server: Weak<MockInner>,
    sender: async_channel::Sender<FirestoreResult<WriteResponse>>,
    receiver: async_channel::Receiver<FirestoreResult<WriteResponse>>,
}

impl MockWriteStream {
    fn fail(&self, error: FirestoreError) {
        let _ = self.sender.try_send(Err(error));
        self.sender.close();
    }
}

#[async_trait]
impl StreamHandle<WriteRequest, WriteResponse> for MockWriteStream {
    async fn send(&self, request: WriteRequest) -> FirestoreResult<()> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| unavailable("The mock backend is gone"))?;
        match request {
            WriteRequest::Handshake => {
                let stream_token = {
                    let mut state = server.state.lock().unwrap();
                    state.ensure_available()?;
                    state.next_stream_token()
                };
                let _ = self.sender.try_send(Ok(WriteResponse {
                    stream_token,
                    commit_version: SnapshotVersion::min(),
                    results: Vec::new(),
                }));
            }
            WriteRequest::Mutations { mutations, .. } => match server.commit(mutations) {
                Ok(response) => {
                    let stream_token = server.state.lock().unwrap().next_stream_token();
                    let _ = self.sender.try_send(Ok(WriteResponse {
                        stream_token,
                        commit_version: response.commit_version,
                        results: response.results,
                    }));
                }
                // The backend closes the stream after a failed write.
                Err(error) => self.fail(error),
            },
        }
        Ok(())
    }

    async fn next(&self) -> Option<FirestoreResult<WriteResponse>> {
        self.receiver.recv().await.ok()
    }

    fn close(&self) {
        self.sender.close();
    }
}

fn matching_documents(documents: &BTreeMap<DocumentKey, MutableDocument>, target: &Target) -> Vec<MutableDocument> {
    let mut matching: Vec<MutableDocument> = documents
        .values()
        .filter(|document| target.matches(document))
        .cloned()
        .collect();
    matching.sort_by(|left, right| target.compare(left, right));
    if let Some(limit) = target.limit {
        matching.truncate(limit as usize);
    }
    matching
}

fn global_snapshot(version: SnapshotVersion) -> WatchResponse {
    WatchResponse::with_snapshot_version(
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_resume_token(resume_token(version)),
        ),
        version,
    )
}

fn resume_token(version: SnapshotVersion) -> BytesValue {
    BytesValue::new(version.to_micros().to_be_bytes().to_vec())
}

fn server_transform_results(mutation: &Mutation, existing: &MutableDocument, commit_time: Timestamp) -> Vec<FirestoreValue> {
    mutation
        .field_transforms()
        .iter()
        .map(|transform| match transform.operation() {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(commit_time),
            operation => operation.apply_to_local_view(existing.field(transform.field_path()), commit_time),
        })
        .collect()
}

fn precondition_error(precondition: &Precondition, key: &DocumentKey) -> FirestoreError {
    let path = key.path().canonical_string();
    match precondition {
        Precondition::Exists(true) => not_found(format!("No document to update: {path}")),
        Precondition::Exists(false) => already_exists(format!("Document already exists: {path}")),
        _ => failed_precondition(format!("The document {path} was modified concurrently")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::target_data::{QueryPurpose, TargetData};
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{FieldPath, ResourcePath};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
        map
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    #[tokio::test]
    async fn listen_replays_current_results_then_a_snapshot() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_document(key("rooms/a"), data(1));
        let stream = datastore.open_watch_stream().await.unwrap();
        stream
            .send(WatchRequest::Listen(TargetData::new(
                rooms().listen_target(),
                2,
                QueryPurpose::Listen,
                1,
            )))
            .await
            .unwrap();

        let mut messages = Vec::new();
        for _ in 0..4 {
            messages.push(stream.next().await.unwrap().unwrap());
        }
        assert!(matches!(
            &messages[0].change,
            WatchChange::TargetChange(change) if change.state == TargetChangeState::Added
        ));
        assert!(matches!(&messages[1].change, WatchChange::DocumentChange(_)));
        assert!(!messages[3].snapshot_version.is_min());
        assert_eq!(datastore.active_targets(), BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn commits_check_preconditions_atomically() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let err = datastore
            .commit(vec![
                Mutation::set(key("rooms/a"), data(1)),
                Mutation::verify(key("rooms/b"), Precondition::Exists(true)),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::NotFound);
        assert!(datastore.document(&key("rooms/a")).is_none());

        let response = datastore
            .commit(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(
            datastore.document(&key("rooms/a")).unwrap().version(),
            response.commit_version
        );
        assert_eq!(datastore.run_aggregation_query(&rooms()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_backend_rejects_streams() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let stream = datastore.open_write_stream().await.unwrap();
        datastore.set_network_available(false);
        let error = stream.next().await.unwrap().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::Unavailable);
        assert!(stream.next().await.is_none());
        assert!(datastore.open_watch_stream().await.is_err());
    }
}
