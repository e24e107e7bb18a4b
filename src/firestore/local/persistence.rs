use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_lock::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::db_key;
use crate::firestore::error::{
    data_loss, failed_precondition, primary_lease_lost, unavailable, FirestoreResult,
};
use crate::firestore::local::schema::{
    self, DbOwner, DbTargetGlobal, GLOBALS, GLOBAL_KEY, OWNER_KEY, TARGET_GLOBALS,
};
use crate::firestore::local::simple_db::{
    has_prefix, DbKey, FileBackend, KeyPart, KvBackend, MemoryBackend, StoreData,
};
use crate::util::assert::hard_assert;

/// Attempts made to commit a transaction before giving up.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// A lease older than this may be taken over by another client.
pub const MAX_PRIMARY_ELIGIBLE_AGE_MS: i64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only while this client holds the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

enum TransactionFailure {
    Op(crate::firestore::error::FirestoreError),
    Commit(String),
}

type PendingChanges = BTreeMap<String, BTreeMap<DbKey, Option<Value>>>;

/// Transactional access to the named stores.
///
/// One transaction runs at a time. Writes are buffered and become visible to
/// other transactions only when the whole transaction commits.
pub struct Persistence {
    backend: Box<dyn KvBackend>,
    data: StdMutex<StoreData>,
    turn: Mutex<()>,
    client_id: String,
    /// Highest listen sequence number handed out so far.
    highest_sequence_number: StdMutex<i64>,
    primary: AtomicBool,
    started: AtomicBool,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("backend", &self.backend)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl Persistence {
    /// Opens `backend`, upgrading its schema if needed.
    pub fn open(backend: Box<dyn KvBackend>, client_id: impl Into<String>) -> FirestoreResult<Arc<Self>> {
        let mut data = backend.load()?.unwrap_or_default();
        if schema::migrate(&mut data)? && backend.is_durable() {
            backend
                .commit(&data)
                .map_err(|fault| unavailable(format!("Failed to upgrade schema: {}", fault.0)))?;
        }
        let highest = read_target_global(&data)?.highest_listen_sequence_number;
        let durable = backend.is_durable();
        Ok(Arc::new(Self {
            backend,
            data: StdMutex::new(data),
            turn: Mutex::new(()),
            client_id: client_id.into(),
            highest_sequence_number: StdMutex::new(highest),
            primary: AtomicBool::new(!durable),
            started: AtomicBool::new(true),
        }))
    }

    pub fn memory(client_id: impl Into<String>) -> FirestoreResult<Arc<Self>> {
        Self::open(Box::new(MemoryBackend::new()), client_id)
    }

    pub fn file(path: impl AsRef<std::path::Path>, client_id: impl Into<String>) -> FirestoreResult<Arc<Self>> {
        Self::open(Box::new(FileBackend::new(path)?), client_id)
    }

    /// Deletes the durable data at `path`. The client owning it must have
    /// been shut down.
    pub fn clear_persistence(path: impl AsRef<std::path::Path>) -> FirestoreResult<()> {
        FileBackend::new(path)?.destroy()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub fn highest_sequence_number(&self) -> i64 {
        *self.highest_sequence_number.lock().unwrap()
    }

    /// Runs `operation` as one atomic transaction.
    ///
    /// `operation` may run more than once if the commit fails. An `Err` from
    /// it discards all buffered writes.
    pub async fn run_transaction<T, F>(
        &self,
        label: &str,
        mode: TransactionMode,
        mut operation: F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        if !self.is_started() {
            return Err(failed_precondition(
                "The persistence layer has been shut down.",
            ));
        }
        let _turn = self.turn.lock().await;
        let mut last_fault = String::new();
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            match self.attempt_transaction(label, mode, &mut operation) {
                Ok(value) => return Ok(value),
                Err(TransactionFailure::Op(err)) => return Err(err),
                Err(TransactionFailure::Commit(fault)) => {
                    log::warn!(
                        "transaction '{label}' failed to commit (attempt {attempt}/{MAX_COMMIT_ATTEMPTS}): {fault}"
                    );
                    last_fault = fault;
                }
            }
        }
        Err(unavailable(format!(
            "Transaction '{label}' could not be committed: {last_fault}"
        )))
    }

    fn attempt_transaction<T, F>(
        &self,
        label: &str,
        mode: TransactionMode,
        operation: &mut F,
    ) -> Result<T, TransactionFailure>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut data = self.data.lock().unwrap();
        if self.backend.has_external_changes() {
            log::debug!("reloading persisted state changed by another client");
            let mut reloaded = self
                .backend
                .load()
                .map_err(TransactionFailure::Op)?
                .unwrap_or_default();
            schema::migrate(&mut reloaded).map_err(TransactionFailure::Op)?;
            *data = reloaded;
        }

        if mode == TransactionMode::ReadWritePrimary && !self.holds_lease(&data) {
            self.primary.store(false, Ordering::SeqCst);
            log::debug!("transaction '{label}' requires the primary lease");
            return Err(TransactionFailure::Op(primary_lease_lost()));
        }

        let base_sequence = self.highest_sequence_number();
        let mut txn = PersistenceTransaction {
            data: &data,
            changes: PendingChanges::new(),
            mode,
            base_sequence,
            sequence_number: None,
        };
        let value = operation(&mut txn).map_err(TransactionFailure::Op)?;
        let PersistenceTransaction {
            mut changes,
            sequence_number,
            ..
        } = txn;

        if let Some(sequence_number) = sequence_number {
            let mut global = read_pending_target_global(&data, &changes).map_err(TransactionFailure::Op)?;
            if sequence_number > global.highest_listen_sequence_number {
                global.highest_listen_sequence_number = sequence_number;
                let encoded = serde_json::to_value(global)
                    .map_err(|err| TransactionFailure::Op(data_loss(err.to_string())))?;
                changes
                    .entry(TARGET_GLOBALS.to_string())
                    .or_default()
                    .insert(db_key![GLOBAL_KEY], Some(encoded));
            }
        }

        if changes.is_empty() {
            return Ok(value);
        }
        hard_assert(
            !mode.is_read_only(),
            format!("read-only transaction '{label}' buffered writes"),
        );

        if self.backend.is_durable() {
            let mut next = data.clone();
            apply_changes(&mut next, changes);
            self.backend
                .commit(&next)
                .map_err(|fault| TransactionFailure::Commit(fault.0))?;
            *data = next;
        } else {
            apply_changes(&mut data, changes);
        }
        if let Some(sequence_number) = sequence_number {
            let mut highest = self.highest_sequence_number.lock().unwrap();
            *highest = (*highest).max(sequence_number);
        }
        Ok(value)
    }

    fn holds_lease(&self, data: &StoreData) -> bool {
        if !self.backend.is_durable() {
            return true;
        }
        match read_owner(data) {
            Ok(Some(owner)) => owner.owner_id == self.client_id,
            _ => false,
        }
    }

    /// Takes or refreshes the primary lease. Returns whether this client is
    /// primary afterwards.
    pub async fn try_acquire_primary_lease(&self) -> FirestoreResult<bool> {
        if !self.backend.is_durable() {
            self.primary.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        let client_id = self.client_id.clone();
        let acquired = self
            .run_transaction("acquire primary lease", TransactionMode::ReadWrite, |txn| {
                let now = chrono::Utc::now().timestamp_millis();
                let owner: Option<DbOwner> = txn.get_as(GLOBALS, &db_key![OWNER_KEY])?;
                let eligible = match &owner {
                    None => true,
                    Some(owner) => {
                        owner.owner_id == client_id
                            || now - owner.lease_timestamp_ms > MAX_PRIMARY_ELIGIBLE_AGE_MS
                    }
                };
                if eligible {
                    txn.put_as(
                        GLOBALS,
                        db_key![OWNER_KEY],
                        &DbOwner {
                            owner_id: client_id.clone(),
                            lease_timestamp_ms: now,
                        },
                    )?;
                }
                Ok(eligible)
            })
            .await?;
        let was_primary = self.primary.swap(acquired, Ordering::SeqCst);
        if was_primary != acquired {
            log::debug!(
                "client {} is now {}",
                self.client_id,
                if acquired { "primary" } else { "secondary" }
            );
        }
        Ok(acquired)
    }

    /// Gives up the lease if this client holds it.
    pub async fn release_primary_lease(&self) -> FirestoreResult<()> {
        if !self.backend.is_durable() {
            return Ok(());
        }
        let client_id = self.client_id.clone();
        self.run_transaction("release primary lease", TransactionMode::ReadWrite, |txn| {
            let owner: Option<DbOwner> = txn.get_as(GLOBALS, &db_key![OWNER_KEY])?;
            if owner.map(|owner| owner.owner_id == client_id).unwrap_or(false) {
                txn.delete(GLOBALS, db_key![OWNER_KEY]);
            }
            Ok(())
        })
        .await?;
        self.primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting transactions.
    pub async fn shutdown(&self) {
        let _turn = self.turn.lock().await;
        self.started.store(false, Ordering::SeqCst);
    }
}

fn apply_changes(data: &mut StoreData, changes: PendingChanges) {
    for (store, entries) in changes {
        let target = data.entry(store).or_default();
        for (key, value) in entries {
            match value {
                Some(value) => {
                    target.insert(key, value);
                }
                None => {
                    target.remove(&key);
                }
            }
        }
    }
}

fn read_owner(data: &StoreData) -> FirestoreResult<Option<DbOwner>> {
    data.get(GLOBALS)
        .and_then(|store| store.get(&db_key![OWNER_KEY]))
        .map(|value| decode(value.clone()))
        .transpose()
}

fn read_target_global(data: &StoreData) -> FirestoreResult<DbTargetGlobal> {
    Ok(data
        .get(TARGET_GLOBALS)
        .and_then(|store| store.get(&db_key![GLOBAL_KEY]))
        .map(|value| decode(value.clone()))
        .transpose()?
        .unwrap_or_default())
}

fn read_pending_target_global(
    data: &StoreData,
    changes: &PendingChanges,
) -> FirestoreResult<DbTargetGlobal> {
    match changes
        .get(TARGET_GLOBALS)
        .and_then(|store| store.get(&db_key![GLOBAL_KEY]))
    {
        Some(Some(value)) => decode(value.clone()),
        _ => read_target_global(data),
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> FirestoreResult<T> {
    serde_json::from_value(value).map_err(|err| data_loss(format!("Failed to decode record: {err}")))
}

/// Handle passed to transaction bodies.
pub struct PersistenceTransaction<'a> {
    data: &'a StoreData,
    changes: PendingChanges,
    mode: TransactionMode,
    base_sequence: i64,
    sequence_number: Option<i64>,
}

impl<'a> PersistenceTransaction<'a> {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Listen sequence number stamped on everything this transaction touches.
    /// Allocated on first use, one per transaction.
    pub fn current_sequence_number(&mut self) -> i64 {
        *self
            .sequence_number
            .get_or_insert(self.base_sequence + 1)
    }

    pub fn get(&self, store: &str, key: &DbKey) -> Option<Value> {
        if let Some(pending) = self.changes.get(store).and_then(|entries| entries.get(key)) {
            return pending.clone();
        }
        self.data.get(store).and_then(|entries| entries.get(key)).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, store: &str, key: &DbKey) -> FirestoreResult<Option<T>> {
        self.get(store, key).map(decode).transpose()
    }

    pub fn put(&mut self, store: &str, key: DbKey, value: Value) {
        hard_assert(!self.mode.is_read_only(), "put in a read-only transaction");
        self.changes
            .entry(store.to_string())
            .or_default()
            .insert(key, Some(value));
    }

    pub fn put_as<T: Serialize>(&mut self, store: &str, key: DbKey, value: &T) -> FirestoreResult<()> {
        let encoded = serde_json::to_value(value)
            .map_err(|err| data_loss(format!("Failed to encode record for '{store}': {err}")))?;
        self.put(store, key, encoded);
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: DbKey) {
        hard_assert(!self.mode.is_read_only(), "delete in a read-only transaction");
        self.changes
            .entry(store.to_string())
            .or_default()
            .insert(key, None);
    }

    /// Every row whose key starts with `prefix`, in key order, including this
    /// transaction's own buffered writes.
    pub fn scan(&self, store: &str, prefix: &[KeyPart]) -> Vec<(DbKey, Value)> {
        let mut merged: BTreeMap<DbKey, Value> = BTreeMap::new();
        let start: DbKey = prefix.to_vec();
        if let Some(entries) = self.data.get(store) {
            for (key, value) in entries.range(start.clone()..) {
                if !has_prefix(key, prefix) {
                    break;
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        if let Some(pending) = self.changes.get(store) {
            for (key, value) in pending.range(start..) {
                if !has_prefix(key, prefix) {
                    break;
                }
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        merged.into_iter().collect()
    }

    pub fn scan_as<T: DeserializeOwned>(
        &self,
        store: &str,
        prefix: &[KeyPart],
    ) -> FirestoreResult<Vec<(DbKey, T)>> {
        self.scan(store, prefix)
            .into_iter()
            .map(|(key, value)| decode(value).map(|decoded| (key, decoded)))
            .collect()
    }

    /// Keys only, for association tables.
    pub fn scan_keys(&self, store: &str, prefix: &[KeyPart]) -> Vec<DbKey> {
        self.scan(store, prefix).into_iter().map(|(key, _)| key).collect()
    }

    pub fn delete_prefix(&mut self, store: &str, prefix: &[KeyPart]) {
        for key in self.scan_keys(store, prefix) {
            self.delete(store, key);
        }
    }

    pub fn count(&self, store: &str) -> usize {
        self.scan(store, &[]).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::simple_db::CommitFault;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct FlakyBackend {
        failures_left: Arc<AtomicUsize>,
    }

    impl KvBackend for FlakyBackend {
        fn is_durable(&self) -> bool {
            true
        }

        fn load(&self) -> FirestoreResult<Option<StoreData>> {
            Ok(None)
        }

        fn commit(&self, _data: &StoreData) -> Result<(), CommitFault> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CommitFault("disk full".into()));
            }
            Ok(())
        }

        fn destroy(&self) -> FirestoreResult<()> {
            Ok(())
        }
    }

    fn flaky() -> (Arc<Persistence>, Arc<AtomicUsize>) {
        let backend = FlakyBackend::default();
        let failures = Arc::clone(&backend.failures_left);
        let persistence = Persistence::open(Box::new(backend), "client").unwrap();
        (persistence, failures)
    }

    #[tokio::test]
    async fn writes_are_visible_after_commit_only() {
        let persistence = Persistence::memory("client").unwrap();
        let result: FirestoreResult<()> = persistence
            .run_transaction("fails", TransactionMode::ReadWrite, |txn| {
                txn.put("targets", db_key![1], json!(1));
                assert_eq!(txn.get("targets", &db_key![1]), Some(json!(1)));
                Err(failed_precondition("abort"))
            })
            .await;
        assert!(result.is_err());

        let seen = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok(txn.get("targets", &db_key![1]))
            })
            .await
            .unwrap();
        assert_eq!(seen, None);
    }

    #[tokio::test]
    async fn scan_merges_pending_writes() {
        let persistence = Persistence::memory("client").unwrap();
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                txn.put("mutations", db_key!["u", 1], json!("a"));
                txn.put("mutations", db_key!["u", 2], json!("b"));
                txn.put("mutations", db_key!["v", 1], json!("c"));
                Ok(())
            })
            .await
            .unwrap();
        let keys = persistence
            .run_transaction("scan", TransactionMode::ReadWrite, |txn| {
                txn.delete("mutations", db_key!["u", 1]);
                txn.put("mutations", db_key!["u", 3], json!("d"));
                Ok(txn.scan_keys("mutations", &db_key!["u"]))
            })
            .await
            .unwrap();
        assert_eq!(keys, vec![db_key!["u", 2], db_key!["u", 3]]);
    }

    #[tokio::test]
    async fn commit_faults_retry_then_surface_unavailable() {
        let (persistence, failures) = flaky();
        failures.store(2, Ordering::SeqCst);
        persistence
            .run_transaction("retried", TransactionMode::ReadWrite, |txn| {
                txn.put("targets", db_key![1], json!(1));
                Ok(())
            })
            .await
            .expect("third attempt succeeds");

        let (persistence, failures) = flaky();
        failures.store(10, Ordering::SeqCst);
        let err = persistence
            .run_transaction("doomed", TransactionMode::ReadWrite, |txn| {
                txn.put("targets", db_key![1], json!(1));
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        assert_eq!(failures.load(Ordering::SeqCst), 10 - MAX_COMMIT_ATTEMPTS);
    }

    #[tokio::test]
    async fn sequence_numbers_are_persisted() {
        let persistence = Persistence::memory("client").unwrap();
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |txn| {
                Ok(txn.current_sequence_number())
            })
            .await
            .unwrap();
        let second = persistence
            .run_transaction("b", TransactionMode::ReadWrite, |txn| {
                let n = txn.current_sequence_number();
                assert_eq!(n, txn.current_sequence_number());
                let global: DbTargetGlobal = txn.get_as(TARGET_GLOBALS, &db_key![GLOBAL_KEY])?.unwrap();
                assert_eq!(global.highest_listen_sequence_number, first);
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(persistence.highest_sequence_number(), second);
    }

    #[tokio::test]
    async fn durable_lease_gates_primary_transactions() {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-sync-lease-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let first = Persistence::file(&path, "first").unwrap();
        let second = Persistence::file(&path, "second").unwrap();
        assert!(first.try_acquire_primary_lease().await.unwrap());
        assert!(!second.try_acquire_primary_lease().await.unwrap());

        let err = second
            .run_transaction("gc", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_primary_lease_lost());

        first.release_primary_lease().await.unwrap();
        assert!(second.try_acquire_primary_lease().await.unwrap());
        second
            .run_transaction("gc", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .await
            .unwrap();
        let _ = std::fs::remove_file(path);
    }
}
