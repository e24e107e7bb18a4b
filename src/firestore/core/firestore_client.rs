use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use once_cell::sync::OnceCell;

use crate::firestore::core::database_context::DatabaseContext;
use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener, SnapshotObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::settings::{FirestoreSettings, PersistenceSettings};
use crate::firestore::core::sync_engine::{OnlineStateSource, SyncEngine, SyncEngineListener};
use crate::firestore::core::transaction::Transaction;
use crate::firestore::core::transaction_runner::{TransactionOptions, TransactionRunner};
use crate::firestore::core::user::User;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, failed_precondition, unavailable, FirestoreResult};
use crate::firestore::local::{
    IndexBackfillerScheduler, LocalStore, LruScheduler, MemorySharedClientState, Persistence,
};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::{Datastore, RemoteStore};
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// How often the primary lease is refreshed, and how often a secondary
/// checks whether it can take over.
const CLIENT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// Where a one-shot read takes its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// The backend when reachable, the cache otherwise.
    #[default]
    Default,
    /// The backend only; fails while offline.
    Server,
    /// The local cache only.
    Cache,
}

/// Client of one Firestore database.
///
/// Owns the local store, the remote store, the sync engine and the event
/// manager and runs them on a single async queue. Every public method hops
/// onto that queue.
pub struct FirestoreClient {
    context: DatabaseContext,
    datastore: Arc<dyn Datastore>,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: Arc<LruScheduler>,
    backfill_scheduler: Arc<IndexBackfillerScheduler>,
    lease_refresh: StdMutex<Option<DelayedOperation>>,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Opens the local cache, connects the components and starts talking to
    /// `datastore` as `user`.
    pub async fn start(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        datastore: Arc<dyn Datastore>,
        user: User,
    ) -> FirestoreResult<Arc<Self>> {
        let context = DatabaseContext::new(database_id, settings)?;
        let settings = context.settings().clone();
        let queue = context.queue().clone();

        let local_store = Arc::new(LocalStore::new(
            Arc::clone(context.persistence()),
            user.clone(),
            settings.index_auto_creation.clone(),
        ));
        local_store.start().await?;

        let engine_cell: Arc<OnceCell<Weak<SyncEngine>>> = Arc::new(OnceCell::new());
        let handler_cell = Arc::clone(&engine_cell);
        let handler_queue = queue.clone();
        let remote_store = RemoteStore::new(
            context.database_id().clone(),
            Arc::clone(&local_store),
            Arc::clone(&datastore),
            queue.clone(),
            Arc::new(move |online_state| {
                let Some(engine) = handler_cell.get().cloned() else {
                    return;
                };
                handler_queue.enqueue_and_forget(async move {
                    if let Some(engine) = engine.upgrade() {
                        engine
                            .apply_online_state_change(online_state, OnlineStateSource::RemoteStore)
                            .await;
                    }
                });
            }),
        );

        let event_manager = Arc::new(EventManager::new());
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::new(MemorySharedClientState::new()),
            Arc::clone(&event_manager) as Arc<dyn SyncEngineListener>,
            user,
            settings.max_concurrent_limbo_resolutions,
        );
        let _ = engine_cell.set(Arc::downgrade(&sync_engine));

        let lru_scheduler = LruScheduler::new(
            queue.clone(),
            &local_store,
            Arc::new(local_store.new_lru_garbage_collector(settings.lru_params())),
        );
        let backfill_scheduler =
            IndexBackfillerScheduler::new(queue.clone(), &local_store, Arc::new(local_store.new_index_backfiller()));

        let client = Arc::new(Self {
            context,
            datastore,
            local_store,
            remote_store,
            sync_engine,
            event_manager,
            lru_scheduler,
            backfill_scheduler,
            lease_refresh: StdMutex::new(None),
            terminated: AtomicBool::new(false),
        });

        let persistence = Arc::clone(client.context.persistence());
        let engine = Arc::clone(&client.sync_engine);
        queue
            .enqueue(async move {
                let is_primary = persistence.try_acquire_primary_lease().await?;
                engine.apply_primary_state(is_primary).await
            })
            .await?;

        client.lru_scheduler.start();
        client.backfill_scheduler.start();
        if client.context.persistence().is_durable() {
            client.schedule_lease_refresh();
        }
        log::debug!("client {} started", client.context.client_id());
        Ok(client)
    }

    pub fn database_id(&self) -> &DatabaseId {
        self.context.database_id()
    }

    pub fn client_id(&self) -> &str {
        self.context.client_id()
    }

    pub fn queue(&self) -> &AsyncQueue {
        self.context.queue()
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Listens to `query`. Snapshots and errors go to `observer` until the
    /// returned registration is removed or dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        self.verify_not_terminated()?;
        let listener = Arc::new(QueryListener::new(query, options, observer));
        let registered = Arc::clone(&listener);
        let events = Arc::clone(&self.event_manager);
        let engine = Arc::clone(&self.sync_engine);
        self.queue()
            .enqueue(async move { events.listen(registered, &engine).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue().clone(),
            event_manager: Arc::downgrade(&self.event_manager),
            sync_engine: Arc::downgrade(&self.sync_engine),
            listener: Some(listener),
        })
    }

    /// Reads the results of `query` once.
    pub async fn get_documents(&self, query: Query, source: Source) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        match source {
            Source::Cache => {
                let local_store = Arc::clone(&self.local_store);
                self.queue()
                    .enqueue(async move { read_documents_from_cache(&local_store, query).await })
                    .await
            }
            Source::Default | Source::Server => {
                let snapshot = self.read_via_snapshot_listener(query).await?;
                if snapshot.from_cache && source == Source::Server {
                    return Err(unavailable(
                        "Failed to get documents from server. (However, these documents may exist in the local cache. \
                         Run again without setting source to \"server\" to retrieve the cached documents.)",
                    ));
                }
                Ok(snapshot)
            }
        }
    }

    /// Reads one document. `None` means the document is known not to exist.
    pub async fn get_document(&self, key: DocumentKey, source: Source) -> FirestoreResult<Option<MutableDocument>> {
        self.verify_not_terminated()?;
        match source {
            Source::Cache => {
                let local_store = Arc::clone(&self.local_store);
                self.queue()
                    .enqueue(async move {
                        let document = local_store.read_document(&key).await?;
                        if document.is_found_document() {
                            Ok(Some(document))
                        } else if document.is_no_document() {
                            Ok(None)
                        } else {
                            Err(unavailable(
                                "Failed to get document from cache. (However, this document may exist on the server. \
                                 Run again without setting 'source' in the GetOptions to attempt to retrieve the \
                                 document from the server.)",
                            ))
                        }
                    })
                    .await
            }
            Source::Default | Source::Server => {
                let snapshot = self.read_via_snapshot_listener(Query::for_document(&key)).await?;
                let document = snapshot.documents.get(&key).cloned();
                match document {
                    None if snapshot.from_cache => Err(unavailable("Failed to get document because the client is offline.")),
                    Some(_) if snapshot.from_cache && source == Source::Server => Err(unavailable(
                        "Failed to get document from server. (However, this document does exist in the local cache. \
                         Run again without setting source to \"server\" to retrieve the cached document.)",
                    )),
                    document => Ok(document),
                }
            }
        }
    }

    /// Applies `mutations` locally and resolves once the backend accepted
    /// them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let engine = Arc::clone(&self.sync_engine);
        let acknowledgement = self
            .queue()
            .enqueue(async move { engine.write(mutations).await })
            .await?;
        acknowledgement
            .await
            .map_err(|_| cancelled("The write was cancelled before it was acknowledged."))?
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let engine = Arc::clone(&self.sync_engine);
        let done = self
            .queue()
            .enqueue(async move { engine.register_pending_writes_callback().await })
            .await?;
        done.await
            .map_err(|_| cancelled("Waiting for pending writes was cancelled."))?
    }

    /// Runs `update_fn` in a transaction against the backend, retrying on
    /// contention.
    pub async fn run_transaction<F, Fut, T>(&self, update_fn: F) -> FirestoreResult<T>
    where
        F: Fn(Arc<Transaction>) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        self.verify_not_terminated()?;
        let options = TransactionOptions {
            max_attempts: self.context.settings().transaction_max_attempts,
            ..TransactionOptions::default()
        };
        TransactionRunner::new(self.queue().clone(), Arc::clone(&self.datastore), options, update_fn)
            .run()
            .await
    }

    /// Switches the client to `user`. Views are recomputed against the new
    /// user's pending writes.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let engine = Arc::clone(&self.sync_engine);
        self.queue()
            .enqueue(async move { engine.handle_credential_change(user).await })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.remote_store.clone();
        self.queue()
            .enqueue(async move { remote_store.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.remote_store.clone();
        self.queue()
            .enqueue(async move {
                remote_store.disable_network().await;
                Ok(())
            })
            .await
    }

    /// Shuts the client down. Pending work is dropped and later calls fail
    /// with `Cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let queue = self.queue().clone();
        queue.enter_restricted_mode();

        self.lru_scheduler.stop();
        self.backfill_scheduler.stop();
        if let Some(refresh) = self.lease_refresh.lock().unwrap().take() {
            refresh.cancel();
        }

        let remote_store = self.remote_store.clone();
        let persistence = Arc::clone(self.context.persistence());
        queue
            .enqueue_even_while_restricted(async move {
                remote_store.shutdown().await;
                if let Err(err) = persistence.release_primary_lease().await {
                    log::warn!("failed to release the primary lease: {err}");
                }
                persistence.shutdown().await;
                Ok(())
            })
            .await?;
        log::debug!("client {} terminated", self.context.client_id());
        Ok(())
    }

    /// Deletes the durable cache. Only allowed once the client is
    /// terminated.
    pub async fn clear_persistence(&self) -> FirestoreResult<()> {
        if !self.is_terminated() {
            return Err(failed_precondition(
                "Persistence can only be cleared before a Firestore instance is initialized or after it is terminated.",
            ));
        }
        match &self.context.settings().persistence {
            PersistenceSettings::Memory => Ok(()),
            PersistenceSettings::Durable { path } => Persistence::clear_persistence(path),
        }
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(cancelled("The client has already been terminated."));
        }
        Ok(())
    }

    /// Listens until the first snapshot that reflects the backend, or a
    /// cached one while offline.
    async fn read_via_snapshot_listener(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(StdMutex::new(Some(sender)));
        let observer: SnapshotObserver = Arc::new(move |result| {
            if let Some(sender) = sender.lock().unwrap().take() {
                let _ = sender.send(result);
            }
        });
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let registration = self.listen(query, options, observer).await?;
        let result = receiver
            .await
            .map_err(|_| cancelled("The read was cancelled."))?;
        registration.remove();
        result
    }

    fn schedule_lease_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = self.queue().enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            CLIENT_METADATA_REFRESH_INTERVAL,
            move || async move {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                client.lease_refresh.lock().unwrap().take();
                let persistence = Arc::clone(client.context.persistence());
                let was_primary = persistence.is_primary();
                match persistence.try_acquire_primary_lease().await {
                    Ok(is_primary) if is_primary != was_primary => {
                        if let Err(err) = client.sync_engine.apply_primary_state(is_primary).await {
                            log::warn!("failed to apply primary state: {err}");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("failed to refresh the primary lease: {err}"),
                }
                if !client.is_terminated() {
                    client.schedule_lease_refresh();
                }
            },
        );
        *self.lease_refresh.lock().unwrap() = Some(task);
    }
}

async fn read_documents_from_cache(local_store: &LocalStore, query: Query) -> FirestoreResult<ViewSnapshot> {
    let result = local_store.execute_query(&query, true).await?;
    let mut view = View::new(query, result.remote_keys.clone());
    let doc_changes = view.compute_doc_changes(&result.documents, None);
    let change = view.apply_changes(doc_changes, false, None, false);
    Ok(change.snapshot.unwrap_or_else(|| view.compute_initial_snapshot()))
}

/// Handle of an active listener. Dropping it stops the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    sync_engine: Weak<SyncEngine>,
    listener: Option<Arc<QueryListener>>,
}

impl ListenerRegistration {
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let event_manager = self.event_manager.clone();
        let sync_engine = self.sync_engine.clone();
        self.queue.enqueue_and_forget(async move {
            let (Some(event_manager), Some(sync_engine)) = (event_manager.upgrade(), sync_engine.upgrade()) else {
                return;
            };
            if let Err(err) = event_manager.unlisten(&listener, &sync_engine).await {
                log::warn!("failed to stop listening to {}: {err}", listener.query().canonical_id());
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{FieldPath, ResourcePath};
    use crate::firestore::remote::MockDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(name: &str) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_segment("name"), FirestoreValue::from(name));
        map
    }

    async fn client() -> (Arc<FirestoreClient>, MockDatastore) {
        let database_id = DatabaseId::default("p");
        let datastore = MockDatastore::new(database_id.clone());
        let client = FirestoreClient::start(
            database_id,
            FirestoreSettings::default(),
            Arc::new(datastore.clone()),
            User::unauthenticated(),
        )
        .await
        .unwrap();
        (client, datastore)
    }

    #[tokio::test]
    async fn reads_from_server_and_cache() {
        let (client, datastore) = client().await;
        datastore.set_document(key("rooms/a"), data("a"));

        let rooms = Query::new(ResourcePath::from_string("rooms").unwrap());
        let snapshot = client.get_documents(rooms.clone(), Source::Server).await.unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);

        let document = client.get_document(key("rooms/a"), Source::Default).await.unwrap();
        assert_eq!(document.unwrap().data(), &data("a"));
        let missing = client.get_document(key("rooms/zz"), Source::Server).await.unwrap();
        assert!(missing.is_none());

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn writes_are_acknowledged_and_cached() {
        let (client, datastore) = client().await;
        client
            .write(vec![Mutation::set(key("rooms/a"), data("a"))])
            .await
            .unwrap();
        assert!(datastore.document(&key("rooms/a")).is_some());

        let cached = client.get_document(key("rooms/a"), Source::Cache).await.unwrap();
        assert_eq!(cached.unwrap().data(), &data("a"));
        client.wait_for_pending_writes().await.unwrap();
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn runs_transactions() {
        let (client, datastore) = client().await;
        datastore.set_document(key("rooms/a"), data("a"));

        let name = client
            .run_transaction(|transaction| async move {
                let document = transaction.get(&key("rooms/a")).await?;
                transaction.set(key("rooms/b"), document.data().clone());
                Ok(document.key().id().to_string())
            })
            .await
            .unwrap();
        assert_eq!(name, "a");
        assert_eq!(datastore.document(&key("rooms/b")).unwrap().data(), &data("a"));
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_rejects_later_calls_and_gates_clear_persistence() {
        let (client, _datastore) = client().await;
        let err = client.clear_persistence().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

        client.terminate().await.unwrap();
        client.clear_persistence().await.unwrap();
        let err = client
            .write(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn dropping_the_registration_stops_the_listener() {
        let (client, datastore) = client().await;
        let rooms = Query::new(ResourcePath::from_string("rooms").unwrap());
        let received = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&received);
        let observer: SnapshotObserver = Arc::new(move |_| *counter.lock().unwrap() += 1);

        let registration = client
            .listen(rooms.clone(), ListenOptions::default(), observer)
            .await
            .unwrap();
        datastore.set_document(key("rooms/a"), data("a"));
        crate::platform::runtime::sleep(Duration::from_millis(50)).await;
        client.queue().drain().await.unwrap();
        assert!(*received.lock().unwrap() >= 1);

        drop(registration);
        client.queue().drain().await.unwrap();
        assert_eq!(client.event_manager.listener_count(&rooms), 0);
        client.terminate().await.unwrap();
    }
}
