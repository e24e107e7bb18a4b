use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::db_key;
use crate::firestore::constants::BATCH_ID_UNKNOWN;
use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{DbMutationQueue, DOCUMENT_MUTATIONS, MUTATIONS, MUTATION_QUEUES};
use crate::firestore::local::simple_db::KeyPart;
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp};
use crate::firestore::value::BytesValue;
use crate::util::assert::{fail, hard_assert};

/// The queue of local write batches not yet acknowledged by the backend, one
/// per user.
///
/// Batches live in `mutations` keyed by `[user, batch_id]`; the
/// `document_mutations` rows `[user, path, batch_id]` index them by
/// document.
#[derive(Debug)]
pub struct MutationQueue {
    user_id: String,
    index_manager: Arc<IndexManager>,
}

impl MutationQueue {
    pub fn new(user_id: impl Into<String>, index_manager: Arc<IndexManager>) -> Self {
        Self {
            user_id: user_id.into(),
            index_manager,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<DbMutationQueue> {
        Ok(txn
            .get_as(MUTATION_QUEUES, &db_key![&self.user_id])?
            .unwrap_or(DbMutationQueue {
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: BytesValue::empty(),
                next_batch_id: 1,
            }))
    }

    fn save_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        metadata: &DbMutationQueue,
    ) -> FirestoreResult<()> {
        txn.put_as(MUTATION_QUEUES, db_key![&self.user_id], metadata)
    }

    /// True if the queue holds no batches.
    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> bool {
        txn.scan_keys(MUTATIONS, &db_key![&self.user_id]).is_empty()
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut metadata = self.metadata(txn)?;
        let batch_id = metadata.next_batch_id;
        metadata.next_batch_id += 1;
        self.save_metadata(txn, &metadata)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        txn.put_as(MUTATIONS, db_key![&self.user_id, batch_id], &batch)?;
        for mutation in &batch.mutations {
            let key = mutation.key();
            txn.put(
                DOCUMENT_MUTATIONS,
                db_key![&self.user_id, key.path().canonical_string(), batch_id],
                Value::Null,
            );
            self.index_manager
                .add_to_collection_parent_index(txn, &key.collection_path());
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get_as(MUTATIONS, &db_key![&self.user_id, batch_id])
    }

    /// The first batch with an id greater than `batch_id`, i.e. the next one
    /// to send.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: i32,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .get_all_mutation_batches(txn)?
            .into_iter()
            .find(|batch| batch.batch_id > batch_id))
    }

    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> i32 {
        txn.scan_keys(MUTATIONS, &db_key![&self.user_id])
            .last()
            .and_then(|key| key.get(1).and_then(KeyPart::as_int))
            .map(|id| id as i32)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan_as::<MutationBatch>(MUTATIONS, &db_key![&self.user_id])?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.get_all_mutation_batches_affecting_document_keys(txn, std::iter::once(key))
    }

    /// Batches touching any of `keys`, in batch id order and without
    /// duplicates.
    pub fn get_all_mutation_batches_affecting_document_keys<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = db_key![&self.user_id, key.path().canonical_string()];
            for row in txn.scan_keys(DOCUMENT_MUTATIONS, &prefix) {
                if let Some(id) = row.get(2).and_then(KeyPart::as_int) {
                    batch_ids.insert(id as i32);
                }
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Batches touching documents directly inside the query's collection.
    /// Collection group queries are resolved per collection by the caller.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries must be split per collection",
        );
        let query_path = query.path();
        let mut batch_ids = BTreeSet::new();
        for row in txn.scan_keys(DOCUMENT_MUTATIONS, &db_key![&self.user_id]) {
            let (Some(path), Some(id)) = (
                row.get(1).and_then(KeyPart::as_str),
                row.get(2).and_then(KeyPart::as_int),
            ) else {
                continue;
            };
            let key = DocumentKey::from_string(path)?;
            let matches = if query.is_document_query() {
                key.path() == query_path
            } else {
                query_path.is_immediate_parent_of(key.path())
            };
            if matches {
                batch_ids.insert(id as i32);
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    fn lookup_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_ids: BTreeSet<i32>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => fail(format!(
                    "Dangling document-mutation reference found: batch {batch_id} does not exist"
                )),
            }
        }
        Ok(batches)
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let first = txn
            .scan_keys(MUTATIONS, &db_key![&self.user_id])
            .first()
            .and_then(|key| key.get(1).and_then(KeyPart::as_int));
        hard_assert(
            first == Some(batch.batch_id as i64),
            format!(
                "Can only remove the first entry of the mutation queue (removing {}, first is {:?})",
                batch.batch_id, first
            ),
        );
        txn.delete(MUTATIONS, db_key![&self.user_id, batch.batch_id]);
        for mutation in &batch.mutations {
            txn.delete(
                DOCUMENT_MUTATIONS,
                db_key![
                    &self.user_id,
                    mutation.key().path().canonical_string(),
                    batch.batch_id
                ],
            );
        }
        Ok(())
    }

    /// Records the acknowledgement of `batch` and the stream token it came
    /// with. The batch itself is removed separately.
    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: BytesValue,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = stream_token;
        self.save_metadata(txn, &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<BytesValue> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        stream_token: BytesValue,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = stream_token;
        self.save_metadata(txn, &metadata)
    }

    /// Asserts the queue's structural invariants: contiguous batch ids below
    /// the persisted next id, and no document index row without its batch.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let metadata = self.metadata(txn)?;
        let batch_ids: Vec<i64> = txn
            .scan_keys(MUTATIONS, &db_key![&self.user_id])
            .iter()
            .filter_map(|key| key.get(1).and_then(KeyPart::as_int))
            .collect();
        for pair in batch_ids.windows(2) {
            hard_assert(
                pair[1] == pair[0] + 1,
                format!("Mutation queue has a gap between batches {} and {}", pair[0], pair[1]),
            );
        }
        if let Some(last) = batch_ids.last() {
            hard_assert(
                *last < metadata.next_batch_id as i64,
                format!(
                    "Batch {last} is not below the next batch id {}",
                    metadata.next_batch_id
                ),
            );
        }

        let known: BTreeSet<i64> = batch_ids.into_iter().collect();
        for row in txn.scan_keys(DOCUMENT_MUTATIONS, &db_key![&self.user_id]) {
            let id = row.get(2).and_then(KeyPart::as_int);
            hard_assert(
                id.map(|id| known.contains(&id)).unwrap_or(false),
                format!("Dangling document-mutation reference found: {row:?}"),
            );
        }
        Ok(())
    }
}

/// Whether any user's queue still has a pending write for `key`. Such
/// documents must stay in the cache.
pub fn mutation_queues_contain_key(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
    let path = key.path().canonical_string();
    txn.scan_keys(DOCUMENT_MUTATIONS, &[])
        .iter()
        .any(|row| row.get(1).and_then(KeyPart::as_str) == Some(path.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn set(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::empty())
    }

    fn queue(user: &str) -> MutationQueue {
        MutationQueue::new(user, Arc::new(IndexManager::new()))
    }

    #[tokio::test]
    async fn batch_ids_increase_and_are_never_reused() {
        let persistence = Persistence::memory("client").unwrap();
        let queue = queue("alice");
        let ids = persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                let first = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
                let second = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/b")])?;
                queue.remove_mutation_batch(txn, &first)?;
                queue.remove_mutation_batch(txn, &second)?;
                assert!(queue.check_empty(txn));
                let third = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/c")])?;
                queue.perform_consistency_check(txn)?;
                Ok(vec![first.batch_id, second.batch_id, third.batch_id])
            })
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn lookups_by_key_and_query() {
        let persistence = Persistence::memory("client").unwrap();
        let queue = queue("alice");
        persistence
            .run_transaction("lookups", TransactionMode::ReadWrite, |txn| {
                queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![set("rooms/a/messages/m1"), set("rooms/b")],
                )?;
                queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;

                let key = DocumentKey::from_string("rooms/a").unwrap();
                let ids: Vec<i32> = queue
                    .get_all_mutation_batches_affecting_document_key(txn, &key)?
                    .iter()
                    .map(|batch| batch.batch_id)
                    .collect();
                assert_eq!(ids, vec![1, 3]);

                let query = Query::new(ResourcePath::from_string("rooms").unwrap());
                let ids: Vec<i32> = queue
                    .get_all_mutation_batches_affecting_query(txn, &query)?
                    .iter()
                    .map(|batch| batch.batch_id)
                    .collect();
                assert_eq!(ids, vec![1, 2, 3]);

                assert_eq!(queue.get_highest_unacknowledged_batch_id(txn), 3);
                let next = queue.get_next_mutation_batch_after_batch_id(txn, 1)?.unwrap();
                assert_eq!(next.batch_id, 2);
                assert!(queue.get_next_mutation_batch_after_batch_id(txn, 3)?.is_none());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queues_are_per_user() {
        let persistence = Persistence::memory("client").unwrap();
        let alice = queue("alice");
        let bob = queue("bob");
        persistence
            .run_transaction("users", TransactionMode::ReadWrite, |txn| {
                alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
                assert!(bob.check_empty(txn));
                assert!(mutation_queues_contain_key(txn, &DocumentKey::from_string("rooms/a").unwrap()));
                assert_eq!(bob.get_highest_unacknowledged_batch_id(txn), BATCH_ID_UNKNOWN);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acknowledge_persists_stream_token() {
        let persistence = Persistence::memory("client").unwrap();
        let queue = queue("alice");
        let token = persistence
            .run_transaction("ack", TransactionMode::ReadWrite, |txn| {
                let batch = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
                queue.acknowledge_batch(txn, &batch, BytesValue::from(vec![1u8, 2, 3]))?;
                queue.get_last_stream_token(txn)
            })
            .await
            .unwrap();
        assert_eq!(token.as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    async fn removing_out_of_order_is_fatal() {
        let persistence = Persistence::memory("client").unwrap();
        let queue = queue("alice");
        let _ = persistence
            .run_transaction("remove", TransactionMode::ReadWrite, |txn| {
                queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])?;
                let second = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/b")])?;
                queue.remove_mutation_batch(txn, &second)
            })
            .await;
    }
}
