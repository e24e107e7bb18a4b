use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use crate::firestore::error::{ignore_if_primary_lease_loss, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::IndexOffset;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const INITIAL_BACKFILL_DELAY: Duration = Duration::from_secs(15);
const REGULAR_BACKFILL_DELAY: Duration = Duration::from_secs(60);
/// Documents indexed per pass, across all collection groups.
pub const MAX_DOCUMENTS_TO_PROCESS: usize = 50;

/// Populates client-side indexes from the remote document cache, a bounded
/// number of documents at a time.
#[derive(Debug)]
pub struct IndexBackfiller {
    index_manager: Arc<IndexManager>,
    remote_documents: Arc<RemoteDocumentCache>,
    max_documents_to_process: usize,
}

impl IndexBackfiller {
    pub fn new(index_manager: Arc<IndexManager>, remote_documents: Arc<RemoteDocumentCache>) -> Self {
        Self {
            index_manager,
            remote_documents,
            max_documents_to_process: MAX_DOCUMENTS_TO_PROCESS,
        }
    }

    pub fn with_max_documents_to_process(mut self, max: usize) -> Self {
        self.max_documents_to_process = max;
        self
    }

    /// Indexes up to the configured number of documents, visiting collection
    /// groups least-recently-updated first. Returns the documents written.
    pub fn backfill(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<usize> {
        let mut remaining = self.max_documents_to_process;
        let mut processed_groups = Vec::new();
        while remaining > 0 {
            let Some(group) = self.index_manager.get_next_collection_group_to_update(txn)? else {
                break;
            };
            if processed_groups.contains(&group) {
                break;
            }
            log::debug!("processing collection group '{group}' for index backfill");
            remaining -= self.write_entries_for_collection_group(txn, &group, remaining)?;
            processed_groups.push(group);
        }
        Ok(self.max_documents_to_process - remaining)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        limit: usize,
    ) -> FirestoreResult<usize> {
        let existing_offset = self
            .index_manager
            .get_min_offset_for_collection_group(txn, collection_group)?;
        let documents = self.remote_documents.get_all_from_collection_group(
            txn,
            collection_group,
            &existing_offset,
            limit,
        )?;
        self.index_manager.update_index_entries(txn, &documents)?;
        let new_offset = documents
            .values()
            .map(IndexOffset::from_document)
            .fold(existing_offset, |latest, offset| latest.max(offset));
        self.index_manager
            .update_collection_group(txn, collection_group, new_offset)?;
        Ok(documents.len())
    }
}

/// Runs the backfiller on the async queue, 15 seconds after start and then
/// every minute.
pub struct IndexBackfillerScheduler {
    queue: AsyncQueue,
    local_store: Weak<LocalStore>,
    backfiller: Arc<IndexBackfiller>,
    task: StdMutex<Option<DelayedOperation>>,
}

impl IndexBackfillerScheduler {
    pub fn new(queue: AsyncQueue, local_store: &Arc<LocalStore>, backfiller: Arc<IndexBackfiller>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            local_store: Arc::downgrade(local_store),
            backfiller,
            task: StdMutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.schedule(INITIAL_BACKFILL_DELAY);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                scheduler.task.lock().unwrap().take();
                if let Some(local_store) = scheduler.local_store.upgrade() {
                    let result = local_store
                        .backfill_indexes(&scheduler.backfiller)
                        .await
                        .map(|count| log::debug!("index backfill wrote {count} documents"));
                    if let Err(err) = ignore_if_primary_lease_loss(result) {
                        log::warn!("ignoring failure during index backfill: {err}");
                    }
                }
                scheduler.schedule(REGULAR_BACKFILL_DELAY);
            });
        *self.task.lock().unwrap() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::{FieldFilter, FilterOperator};
    use crate::firestore::local::index_manager::IndexType;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::{
        DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument,
        ResourcePath, SnapshotVersion,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn document(path: &str, value: i64, read_micros: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FirestoreValue::from(value));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(read_micros),
            MapValue::new(fields),
        )
    }

    #[tokio::test]
    async fn backfills_in_bounded_passes() {
        let persistence = Persistence::memory("client").unwrap();
        let index_manager = Arc::new(IndexManager::new());
        let remote = Arc::new(RemoteDocumentCache::new(Arc::clone(&index_manager)));
        let backfiller = IndexBackfiller::new(Arc::clone(&index_manager), Arc::clone(&remote))
            .with_max_documents_to_process(2);

        persistence
            .run_transaction("setup", TransactionMode::ReadWrite, |txn| {
                index_manager.add_field_index(
                    txn,
                    &FieldIndex::new(
                        "coll",
                        vec![IndexSegment::new(
                            FieldPath::from_segment("count"),
                            IndexKind::Ascending,
                        )],
                    ),
                )?;
                for (index, path) in ["coll/a", "coll/b", "coll/c"].iter().enumerate() {
                    let doc = document(path, index as i64, 10 + index as i64);
                    remote.add_entry(txn, &doc, doc.version())?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let first = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn))
            .await
            .unwrap();
        assert_eq!(first, 2);
        let second = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn))
            .await
            .unwrap();
        assert_eq!(second, 1);
        let third = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| backfiller.backfill(txn))
            .await
            .unwrap();
        assert_eq!(third, 0);

        persistence
            .run_transaction("check", TransactionMode::ReadOnly, |txn| {
                let query = Query::new(ResourcePath::from_string("coll").unwrap()).with_filter(
                    FieldFilter::new(
                        FieldPath::from_segment("count"),
                        FilterOperator::GreaterThanOrEqual,
                        FirestoreValue::from(1i64),
                    ),
                );
                let target = query.to_target();
                assert_eq!(index_manager.get_index_type(txn, &target)?, IndexType::Full);
                let keys = index_manager
                    .get_documents_matching_target(txn, &target)?
                    .unwrap_or_default();
                assert_eq!(keys.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }
}
