use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

/// Where a listener takes its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ListenSource {
    /// Cache first, then the backend.
    #[default]
    Default,
    /// The local cache only; no watch target is opened for the listener.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes or
    /// cache state).
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while online until the backend has
    /// answered.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

struct ListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// A user listener on a query. Filters view snapshots according to its
/// options before handing them to the observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    state: StdMutex<ListenerState>,
}

impl Debug for QueryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("query", &self.query.canonical_id())
            .field("options", &self.options)
            .finish()
    }
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            query,
            options,
            observer,
            state: StdMutex::new(ListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let mut snapshot = snapshot;
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let mut state = self.state.lock().unwrap();
        let raised = if !state.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, state.online_state) {
                state.raised_initial_event = true;
                Some(initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
            Some(snapshot.clone())
        } else {
            None
        };
        state.snapshot = Some(snapshot);
        drop(state);

        match raised {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// Returns whether an event was raised.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let mut state = self.state.lock().unwrap();
        state.online_state = online_state;
        let pending = match &state.snapshot {
            Some(snapshot) if !state.raised_initial_event && self.should_raise_initial_event(snapshot, online_state) => {
                Some(initial_event(snapshot))
            }
            _ => None,
        };
        if pending.is_some() {
            state.raised_initial_event = true;
        }
        drop(state);

        match pending {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Raise an empty cached result only once we know we are offline;
        // the backend may still fill it.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.documents.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    )
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(|listener| listener.listens_to_remote_store())
    }
}

struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans view snapshots out to the listeners of each query. Listeners on
/// equal queries share one view in the sync engine.
pub struct EventManager {
    state: StdMutex<EventManagerState>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum ListenAction {
    FirstListen { remote: bool },
    StartRemote,
    None,
}

#[derive(Clone, Copy)]
enum UnlistenAction {
    LastListen { remote: bool },
    StopRemote,
    None,
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
        }
    }

    /// Registers `listener`, asking `sync_engine` for a view when it is the
    /// first on its query. Errors from the sync engine are reported to the
    /// listener and returned.
    pub async fn listen(&self, listener: Arc<QueryListener>, sync_engine: &SyncEngine) -> FirestoreResult<()> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();

        let action = {
            let mut state = self.state.lock().unwrap();
            match state.queries.get(&canonical_id) {
                None => {
                    state.queries.insert(canonical_id.clone(), QueryListenersInfo::default());
                    ListenAction::FirstListen {
                        remote: listener.listens_to_remote_store(),
                    }
                }
                Some(info) if !info.has_remote_listeners() && listener.listens_to_remote_store() => {
                    ListenAction::StartRemote
                }
                Some(_) => ListenAction::None,
            }
        };

        let result = match action {
            ListenAction::FirstListen { remote } => sync_engine.listen(query.clone(), remote).await.map(Some),
            ListenAction::StartRemote => sync_engine.listen_to_remote_store(&query).await.map(|_| None),
            ListenAction::None => Ok(None),
        };
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!("unable to listen to {canonical_id}: {error}");
                if matches!(action, ListenAction::FirstListen { .. }) {
                    self.state.lock().unwrap().queries.remove(&canonical_id);
                }
                listener.on_error(error.clone());
                return Err(error);
            }
        };

        let (online_state, view_snapshot) = {
            let mut state = self.state.lock().unwrap();
            let online_state = state.online_state;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            if snapshot.is_some() {
                info.view_snapshot = snapshot;
            }
            info.listeners.push(Arc::clone(&listener));
            (online_state, info.view_snapshot.clone())
        };

        listener.apply_online_state_change(online_state);
        if let Some(view_snapshot) = view_snapshot {
            listener.on_view_snapshot(view_snapshot);
        }
        Ok(())
    }

    /// Removes `listener`; the sync engine releases the view once the last
    /// listener of its query is gone.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>, sync_engine: &SyncEngine) -> FirestoreResult<()> {
        let query = listener.query();
        let canonical_id = query.canonical_id();

        let action = {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            if info.listeners.len() == before {
                UnlistenAction::None
            } else if info.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                UnlistenAction::LastListen {
                    remote: listener.listens_to_remote_store(),
                }
            } else if listener.listens_to_remote_store() && !info.has_remote_listeners() {
                UnlistenAction::StopRemote
            } else {
                UnlistenAction::None
            }
        };

        match action {
            UnlistenAction::LastListen { remote } => sync_engine.unlisten(query, remote).await,
            UnlistenAction::StopRemote => sync_engine.unlisten_from_remote_store(query).await,
            UnlistenAction::None => Ok(()),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.state.lock().unwrap().online_state
    }

    /// Listeners currently registered on `query`.
    pub fn listener_count(&self, query: &Query) -> usize {
        self.state
            .lock()
            .unwrap()
            .queries
            .get(&query.canonical_id())
            .map_or(0, |info| info.listeners.len())
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let listeners = {
                let mut state = self.state.lock().unwrap();
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                info.view_snapshot = Some(snapshot.clone());
                info.listeners.clone()
            };
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.state.lock().unwrap().queries.remove(&query.canonical_id());
        if let Some(info) = removed {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, ResourcePath, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn recorder(options: ListenOptions) -> (QueryListener, Arc<StdMutex<Vec<ViewSnapshot>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: SnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            if let Ok(snapshot) = result {
                sink.lock().unwrap().push(snapshot);
            }
        });
        (QueryListener::new(rooms(), options, observer), events)
    }

    fn snapshot(paths: &[&str], from_cache: bool, sync_state_changed: bool) -> ViewSnapshot {
        let query = rooms();
        let mut documents = DocumentSet::for_query(&query);
        let mut changes = Vec::new();
        for path in paths {
            let document = MutableDocument::new_found_document(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::from_micros(1),
                MapValue::empty(),
            );
            documents.insert(document.clone());
            changes.push(DocumentViewChange::new(ChangeType::Added, document));
        }
        ViewSnapshot {
            query,
            old_documents: DocumentSet::new(documents.comparator().clone()),
            documents,
            document_changes: changes,
            mutated_keys: DocumentKeySet::new(),
            from_cache,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    #[test]
    fn empty_cache_result_waits_for_offline() {
        let (listener, events) = recorder(ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot(&[], true, true)));
        assert!(events.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].from_cache);
    }

    #[test]
    fn cached_documents_are_raised_immediately() {
        let (listener, events) = recorder(ListenOptions::default());
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], true, true)));
        assert_eq!(events.lock().unwrap()[0].document_changes.len(), 1);
    }

    #[test]
    fn wait_for_sync_holds_cache_while_online() {
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let (listener, events) = recorder(options);
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(snapshot(&["rooms/a"], true, true)));
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], false, true)));
        assert!(!events.lock().unwrap()[0].from_cache);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (quiet, quiet_events) = recorder(ListenOptions::default());
        let (chatty, chatty_events) = recorder(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        for listener in [&quiet, &chatty] {
            listener.on_view_snapshot(snapshot(&["rooms/a"], true, true));
            let mut synced = snapshot(&[], false, true);
            synced.documents = snapshot(&["rooms/a"], false, true).documents;
            listener.on_view_snapshot(synced);
        }
        assert_eq!(quiet_events.lock().unwrap().len(), 1);
        assert_eq!(chatty_events.lock().unwrap().len(), 2);
    }

    #[test]
    fn watch_error_removes_query() {
        let manager = EventManager::new();
        let errors = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&errors);
        let observer: SnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            if result.is_err() {
                *sink.lock().unwrap() += 1;
            }
        });
        let listener = Arc::new(QueryListener::new(rooms(), ListenOptions::default(), observer));
        manager.state.lock().unwrap().queries.insert(
            rooms().canonical_id(),
            QueryListenersInfo {
                view_snapshot: None,
                listeners: vec![listener],
            },
        );

        manager.on_watch_error(&rooms(), crate::firestore::error::permission_denied("denied"));
        assert_eq!(*errors.lock().unwrap(), 1);
        assert_eq!(manager.listener_count(&rooms()), 0);
    }
}
