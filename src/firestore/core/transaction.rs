use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::error::{aborted, failed_precondition, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldMask, MutableDocument, Mutation, Precondition, SnapshotVersion};
use crate::firestore::remote::Datastore;
use crate::firestore::value::MapValue;

#[derive(Default)]
struct TransactionState {
    /// Version of every document read, `SnapshotVersion::min()` for a
    /// document that did not exist.
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    /// First error raised while buffering writes, reported at commit.
    last_write_error: Option<FirestoreError>,
    committed: bool,
}

/// One attempt of a read-write transaction.
///
/// Reads go straight to the backend and record the version they saw. Writes
/// are buffered and committed together with preconditions pinning every
/// read document to that version, so a concurrent change makes the commit
/// fail and the attempt is retried.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    state: StdMutex<TransactionState>,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            state: StdMutex::new(TransactionState::default()),
        }
    }

    /// Reads `keys` from the backend. All reads must happen before the
    /// first write.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        {
            let state = self.state.lock().unwrap();
            ensure_commit_not_called(&state)?;
            if !state.mutations.is_empty() {
                return Err(invalid_argument(
                    "Firestore transactions require all reads to be executed before all writes.",
                ));
            }
        }
        let documents = self.datastore.batch_get_documents(keys).await?;
        let mut state = self.state.lock().unwrap();
        for document in &documents {
            record_version(&mut state, document)?;
        }
        Ok(documents)
    }

    /// Reads a single document.
    pub async fn get(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let mut documents = self.lookup(std::slice::from_ref(key)).await?;
        documents
            .pop()
            .ok_or_else(|| failed_precondition(format!("no result for document {key}")))
    }

    pub fn set(&self, key: DocumentKey, data: MapValue) {
        let mut state = self.state.lock().unwrap();
        let precondition = precondition_for(&state, &key);
        write(&mut state, vec![Mutation::set(key, data).with_precondition(precondition)]);
    }

    /// Updates the fields of `data` in an existing document.
    pub fn update(&self, key: DocumentKey, data: MapValue) {
        let mut state = self.state.lock().unwrap();
        match precondition_for_update(&state, &key) {
            Ok(precondition) => {
                let mask: FieldMask = data.field_mask();
                write(&mut state, vec![Mutation::patch(key, data, mask, precondition)]);
            }
            Err(err) => {
                state.last_write_error.get_or_insert(err);
            }
        }
    }

    pub fn delete(&self, key: DocumentKey) {
        let mut state = self.state.lock().unwrap();
        let precondition = precondition_for(&state, &key);
        write(&mut state, vec![Mutation::delete(key).with_precondition(precondition)]);
    }

    /// Commits the buffered writes. Documents that were read but not
    /// written are verified to be unchanged.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.state.lock().unwrap();
            ensure_commit_not_called(&state)?;
            if let Some(err) = state.last_write_error.take() {
                return Err(err);
            }
            let unwritten: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !state.written_docs.contains(*key))
                .cloned()
                .collect();
            let mut mutations = std::mem::take(&mut state.mutations);
            for key in unwritten {
                let precondition = precondition_for(&state, &key);
                mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            mutations
        };
        if mutations.is_empty() {
            return Ok(());
        }
        self.datastore.commit(mutations).await.map(|_| ())
    }
}

fn ensure_commit_not_called(state: &TransactionState) -> FirestoreResult<()> {
    if state.committed {
        return Err(failed_precondition("A transaction object cannot be used after its update callback has been invoked."));
    }
    Ok(())
}

fn record_version(state: &mut TransactionState, document: &MutableDocument) -> FirestoreResult<()> {
    let version = if document.is_found_document() {
        document.version()
    } else if document.is_no_document() {
        SnapshotVersion::min()
    } else {
        return Err(invalid_argument(format!(
            "Document version {} has an unexpected type",
            document.key()
        )));
    };
    match state.read_versions.get(document.key()) {
        Some(existing) if *existing != version => Err(aborted("Document version changed between two reads.")),
        Some(_) => Ok(()),
        None => {
            state.read_versions.insert(document.key().clone(), version);
            Ok(())
        }
    }
}

fn precondition_for(state: &TransactionState, key: &DocumentKey) -> Precondition {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if *version == SnapshotVersion::min() {
                Precondition::Exists(false)
            } else {
                Precondition::UpdateTime(*version)
            }
        }
        _ => Precondition::None,
    }
}

fn precondition_for_update(state: &TransactionState, key: &DocumentKey) -> FirestoreResult<Precondition> {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if *version == SnapshotVersion::min() {
                Err(invalid_argument("Can't update a document that doesn't exist."))
            } else {
                Ok(Precondition::UpdateTime(*version))
            }
        }
        _ => Ok(Precondition::Exists(true)),
    }
}

fn write(state: &mut TransactionState, mutations: Vec<Mutation>) {
    for mutation in mutations {
        state.written_docs.insert(mutation.key().clone());
        state.mutations.push(mutation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, FieldPath};
    use crate::firestore::remote::MockDatastore;
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(count: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_segment("count"), FirestoreValue::from_integer(count));
        map
    }

    #[tokio::test]
    async fn commits_writes_with_read_preconditions() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_document(key("counters/a"), data(1));
        let transaction = Transaction::new(Arc::new(datastore.clone()));

        let current = transaction.get(&key("counters/a")).await.unwrap();
        assert!(current.is_found_document());
        transaction.set(key("counters/a"), data(2));
        transaction.commit().await.unwrap();

        assert_eq!(datastore.document(&key("counters/a")).unwrap().data(), &data(2));
        let committed = datastore.committed_mutations();
        assert_eq!(
            committed[0][0].precondition(),
            Precondition::UpdateTime(current.version())
        );
    }

    #[tokio::test]
    async fn concurrent_change_fails_the_commit() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_document(key("counters/a"), data(1));
        let transaction = Transaction::new(Arc::new(datastore.clone()));

        transaction.get(&key("counters/a")).await.unwrap();
        datastore.set_document(key("counters/a"), data(5));
        transaction.set(key("counters/a"), data(2));

        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        assert_eq!(datastore.document(&key("counters/a")).unwrap().data(), &data(5));
    }

    #[tokio::test]
    async fn reads_after_writes_are_rejected() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let transaction = Transaction::new(Arc::new(datastore));
        transaction.set(key("counters/a"), data(1));
        let err = transaction.get(&key("counters/a")).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn updating_a_missing_document_fails_at_commit() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        let transaction = Transaction::new(Arc::new(datastore.clone()));
        let missing = transaction.get(&key("counters/a")).await.unwrap();
        assert!(missing.is_no_document());

        transaction.update(key("counters/a"), data(1));
        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(datastore.committed_mutations().is_empty());
    }

    #[tokio::test]
    async fn unwritten_reads_are_verified() {
        let datastore = MockDatastore::new(DatabaseId::default("p"));
        datastore.set_document(key("counters/a"), data(1));
        let transaction = Transaction::new(Arc::new(datastore.clone()));
        transaction.get(&key("counters/a")).await.unwrap();
        transaction.set(key("counters/b"), data(1));
        transaction.commit().await.unwrap();

        let committed = datastore.committed_mutations();
        assert_eq!(committed[0].len(), 2);
        assert_eq!(committed[0][1].key(), &key("counters/a"));
    }
}
