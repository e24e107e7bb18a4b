use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::settings::IndexAutoCreationSettings;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKeySet, IndexOffset, MutableDocument, MutableDocumentMap, SnapshotVersion,
};

/// Bookkeeping for a single query execution.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    document_read_count: usize,
}

impl QueryContext {
    pub fn document_read_count(&self) -> usize {
        self.document_read_count
    }

    pub fn increment_document_read_count(&mut self, count: usize) {
        self.document_read_count += count;
    }
}

/// Picks the cheapest way to answer a query from the local cache.
///
/// In order of preference: a client-side index, the results of the previous
/// run plus everything changed since, or a full collection scan. Full scans
/// that read many documents per result may create an index for next time.
#[derive(Debug)]
pub struct QueryEngine {
    index_manager: Arc<IndexManager>,
    index_auto_creation: StdMutex<IndexAutoCreationSettings>,
}

impl QueryEngine {
    pub fn new(index_manager: Arc<IndexManager>, index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self {
            index_manager,
            index_auto_creation: StdMutex::new(index_auto_creation),
        }
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.index_auto_creation.lock().unwrap().enabled = enabled;
    }

    /// Documents matching `query` in the local view.
    ///
    /// `last_limbo_free_snapshot_version` and `remote_keys` describe the
    /// previous results of the query's target; pass
    /// [`SnapshotVersion::min`] to skip that path.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<MutableDocumentMap> {
        if let Some(result) = self.perform_query_using_index(txn, local_documents, query)? {
            return Ok(apply_limit(query, result));
        }
        if let Some(result) = self.perform_query_using_remote_keys(
            txn,
            local_documents,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        )? {
            return Ok(apply_limit(query, result));
        }

        let mut context = QueryContext::default();
        let result = local_documents.get_documents_matching_query(
            txn,
            query,
            &IndexOffset::none(),
            Some(&mut context),
        )?;
        self.create_cache_indexes(txn, query, &context, result.len())?;
        Ok(apply_limit(query, result))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let settings = self.index_auto_creation.lock().unwrap().clone();
        if !settings.enabled || query.is_document_query() {
            return Ok(());
        }
        let read = context.document_read_count();
        if read < settings.min_collection_size {
            log::debug!(
                "skipping index creation for {}: scanned {read} documents, below {}",
                query.canonical_id(),
                settings.min_collection_size
            );
            return Ok(());
        }
        if read as f64 > settings.relative_index_read_cost_per_document * result_size as f64 {
            log::debug!(
                "creating index for {}: scanned {read} documents for {result_size} results",
                query.canonical_id()
            );
            self.index_manager
                .create_target_indexes(txn, &query.to_target())?;
        }
        Ok(())
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<Option<MutableDocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        let index_type = self.index_manager.get_index_type(txn, &target)?;
        if index_type == IndexType::None {
            return Ok(None);
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // A partial index may return extra documents or the wrong order,
            // so the limit cannot be applied to the index scan.
            return self.perform_query_using_index(txn, local_documents, &query.without_limit());
        }

        let Some(keys) = self.index_manager.get_documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        let indexed = local_documents.get_documents(txn, &keys)?;
        let offset = self.index_manager.get_min_offset(txn, &target)?;
        let previous = apply_query(query, &indexed);
        if needs_refill(query, &previous, keys.len(), offset.read_time) {
            return self.perform_query_using_index(txn, local_documents, &query.without_limit());
        }
        log::debug!("re-using index for {}", query.canonical_id());
        self.append_remaining_results(txn, local_documents, previous, query, &offset)
            .map(Some)
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<MutableDocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }
        let documents = local_documents.get_documents(txn, remote_keys)?;
        let previous = apply_query(query, &documents);
        if needs_refill(query, &previous, remote_keys.len(), last_limbo_free_snapshot_version) {
            return Ok(None);
        }
        log::debug!(
            "re-using previous results of {} from {}",
            query.canonical_id(),
            last_limbo_free_snapshot_version
        );
        let offset = IndexOffset::create_successor(last_limbo_free_snapshot_version, -1);
        self.append_remaining_results(txn, local_documents, previous, query, &offset)
            .map(Some)
    }

    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        previous: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut result = local_documents.get_documents_matching_query(txn, query, offset, None)?;
        for document in previous {
            result.insert(document.key().clone(), document);
        }
        Ok(result)
    }
}

/// Matching documents sorted by the query's ordering.
fn apply_query(query: &Query, documents: &MutableDocumentMap) -> Vec<MutableDocument> {
    let mut matching: Vec<MutableDocument> = documents
        .values()
        .filter(|document| query.matches(document))
        .cloned()
        .collect();
    matching.sort_by(query.comparator());
    matching
}

/// Whether previous results of a limit query can no longer be trusted: a
/// document dropped out, or the document at the limit edge changed after the
/// results were computed.
fn needs_refill(
    query: &Query,
    sorted_previous: &[MutableDocument],
    remote_key_count: usize,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_key_count != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
    }
}

/// Keeps the documents up to the limit boundary in query order.
pub fn apply_limit(query: &Query, documents: MutableDocumentMap) -> MutableDocumentMap {
    let Some(limit) = query.limit() else {
        return documents;
    };
    let limit = limit as usize;
    if documents.len() <= limit {
        return documents;
    }
    let mut sorted: Vec<MutableDocument> = documents.into_values().collect();
    sorted.sort_by(query.comparator());
    let kept: Vec<MutableDocument> = match query.limit_type() {
        LimitType::First => sorted.into_iter().take(limit).collect(),
        LimitType::Last => {
            let skip = sorted.len() - limit;
            sorted.into_iter().skip(skip).collect()
        }
    };
    kept.into_iter()
        .map(|document| (document.key().clone(), document))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::{Direction, FieldFilter, FilterOperator, OrderBy};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{DocumentKey, FieldPath, ResourcePath};
    use crate::firestore::value::MapValue;

    fn setup(auto_index: bool) -> (Arc<IndexManager>, LocalDocumentsView, QueryEngine) {
        let index_manager = Arc::new(IndexManager::new());
        let view = LocalDocumentsView::new(
            Arc::new(RemoteDocumentCache::new(Arc::clone(&index_manager))),
            Arc::new(MutationQueue::new("alice", Arc::clone(&index_manager))),
            Arc::new(DocumentOverlayCache::new("alice")),
            Arc::clone(&index_manager),
        );
        let settings = IndexAutoCreationSettings {
            enabled: auto_index,
            ..IndexAutoCreationSettings::default()
        };
        let engine = QueryEngine::new(Arc::clone(&index_manager), settings);
        (index_manager, view, engine)
    }

    fn doc(path: &str, priority: i64, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_segment("priority"), priority.into());
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            data,
        )
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn ids(documents: &MutableDocumentMap) -> Vec<String> {
        documents.keys().map(|key| key.id().to_string()).collect()
    }

    #[tokio::test]
    async fn previous_results_are_combined_with_newer_documents() {
        let persistence = Persistence::memory("client").unwrap();
        let (_, view, engine) = setup(false);
        persistence
            .run_transaction("remote keys", TransactionMode::ReadWrite, |txn| {
                let cache = view.remote_document_cache();
                cache.add_entry(txn, &doc("rooms/a", 1, 10), SnapshotVersion::from_micros(10))?;
                cache.add_entry(txn, &doc("rooms/b", 2, 10), SnapshotVersion::from_micros(10))?;
                cache.add_entry(txn, &doc("rooms/c", 3, 20), SnapshotVersion::from_micros(20))?;

                let query = rooms().with_filter(FieldFilter::new(
                    FieldPath::from_segment("priority"),
                    FilterOperator::GreaterThanOrEqual,
                    1i64.into(),
                ));
                let remote_keys: DocumentKeySet =
                    [DocumentKey::from_string("rooms/a").unwrap()].into_iter().collect();
                let result = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::from_micros(10),
                    &remote_keys,
                )?;
                // rooms/b was read at the limbo-free version and is not a
                // previous result, so it is not picked up.
                assert_eq!(ids(&result), vec!["a", "c"]);

                let full = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert_eq!(ids(&full), vec!["a", "b", "c"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limit_to_last_keeps_the_tail() {
        let persistence = Persistence::memory("client").unwrap();
        let (_, view, engine) = setup(false);
        persistence
            .run_transaction("limit", TransactionMode::ReadWrite, |txn| {
                let cache = view.remote_document_cache();
                for (path, priority) in [("rooms/a", 3i64), ("rooms/b", 1), ("rooms/c", 2)] {
                    cache.add_entry(txn, &doc(path, priority, 10), SnapshotVersion::from_micros(10))?;
                }
                let ordered = rooms().with_order_by(OrderBy::new(
                    FieldPath::from_segment("priority"),
                    Direction::Ascending,
                ));
                let last_two = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &ordered.clone().with_limit_to_last(2),
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert_eq!(ids(&last_two), vec!["a", "c"]);
                let first = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &ordered.with_limit_to_first(1),
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert_eq!(ids(&first), vec!["b"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn selective_scans_create_an_index_that_is_used_next_time() {
        let persistence = Persistence::memory("client").unwrap();
        let (index_manager, view, engine) = setup(true);
        let query = rooms().with_filter(FieldFilter::new(
            FieldPath::from_segment("priority"),
            FilterOperator::Equal,
            7i64.into(),
        ));
        persistence
            .run_transaction("auto index", TransactionMode::ReadWrite, |txn| {
                let cache = view.remote_document_cache();
                for index in 0..120i64 {
                    let path = format!("rooms/r{index:03}");
                    let priority = if index == 5 { 7 } else { 0 };
                    cache.add_entry(txn, &doc(&path, priority, 10), SnapshotVersion::from_micros(10))?;
                }
                let result = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert_eq!(ids(&result), vec!["r005"]);
                assert_eq!(index_manager.get_index_type(txn, &query.to_target())?, IndexType::Full);

                // The new index has no entries yet; documents after its
                // offset still come from the collection scan.
                let again = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert_eq!(ids(&again), vec!["r005"]);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn small_collections_do_not_get_indexes() {
        let persistence = Persistence::memory("client").unwrap();
        let (index_manager, view, engine) = setup(true);
        persistence
            .run_transaction("small", TransactionMode::ReadWrite, |txn| {
                let cache = view.remote_document_cache();
                cache.add_entry(txn, &doc("rooms/a", 1, 10), SnapshotVersion::from_micros(10))?;
                let query = rooms().with_filter(FieldFilter::new(
                    FieldPath::from_segment("priority"),
                    FilterOperator::Equal,
                    5i64.into(),
                ));
                engine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::min(),
                    &DocumentKeySet::new(),
                )?;
                assert!(index_manager.get_field_indexes(txn, None)?.is_empty());
                Ok(())
            })
            .await
            .unwrap();
    }
}
