use std::sync::Arc;

use crate::db_key;
use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::schema::{
    remote_document_key, DbRemoteDocument, DbRemoteDocumentGlobal, GLOBAL_KEY, REMOTE_DOCUMENTS,
    REMOTE_DOCUMENT_GLOBAL,
};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, IndexOffset, MutableDocument, MutableDocumentMap, ResourcePath,
    SnapshotVersion,
};
use crate::util::assert::hard_assert;

/// The last known server state of each document, keyed by path.
///
/// Entries may be found documents, tombstones (`NoDocument`) or
/// `UnknownDocument`s created by acknowledged writes. Missing entries read
/// back as invalid documents.
#[derive(Debug)]
pub struct RemoteDocumentCache {
    index_manager: Arc<IndexManager>,
}

impl RemoteDocumentCache {
    pub fn new(index_manager: Arc<IndexManager>) -> Self {
        Self { index_manager }
    }

    /// Stores `document` as read at `read_time`, replacing any previous
    /// entry.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        hard_assert(
            !read_time.is_min(),
            "Cannot add a document to the remote document cache with a read time of zero",
        );
        let key = document.key();
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        let byte_size = stored.estimate_byte_size();
        let previous_size = self.entry_size(txn, key)?;
        txn.put_as(
            REMOTE_DOCUMENTS,
            remote_document_key(key.path()),
            &DbRemoteDocument {
                document: stored,
                byte_size,
            },
        )?;
        self.adjust_size(txn, byte_size as i64 - previous_size)?;
        self.index_manager
            .add_to_collection_parent_index(txn, &key.collection_path());
        Ok(())
    }

    /// Deletes the entry for `key` and returns the bytes it occupied.
    pub fn remove_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<i64> {
        let previous_size = self.entry_size(txn, key)?;
        if previous_size > 0 {
            txn.delete(REMOTE_DOCUMENTS, remote_document_key(key.path()));
            self.adjust_size(txn, -previous_size)?;
        }
        Ok(previous_size)
    }

    pub fn get_entry(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        let record: Option<DbRemoteDocument> =
            txn.get_as(REMOTE_DOCUMENTS, &remote_document_key(key.path()))?;
        Ok(record
            .map(|record| record.document)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone())))
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut documents = MutableDocumentMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    /// Documents directly in `collection` read after `offset`.
    pub fn get_all_from_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        offset: &IndexOffset,
    ) -> FirestoreResult<MutableDocumentMap> {
        let prefix = db_key![collection.canonical_string()];
        let mut documents = MutableDocumentMap::new();
        for (_, record) in txn.scan_as::<DbRemoteDocument>(REMOTE_DOCUMENTS, &prefix)? {
            if &IndexOffset::from_document(&record.document) > offset {
                documents.insert(record.document.key().clone(), record.document);
            }
        }
        Ok(documents)
    }

    /// Up to `limit` documents of `collection_group` read after `offset`, in
    /// read-time order. Feeds the index backfiller.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut candidates = Vec::new();
        for parent in self.index_manager.get_collection_parents(txn, collection_group)? {
            let collection = parent.child([collection_group]);
            candidates.extend(self.get_all_from_collection(txn, &collection, offset)?.into_values());
        }
        candidates.sort_by(|a, b| {
            IndexOffset::from_document(a).cmp(&IndexOffset::from_document(b))
        });
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|document| (document.key().clone(), document))
            .collect())
    }

    /// Candidates for `query` (a collection query) read after `offset`.
    /// Documents in `mutated_documents` are returned even when they do not
    /// match, so pending writes can be applied on top.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_documents: &DocumentKeySet,
        context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        let mut documents = self.get_all_from_collection(txn, query.path(), offset)?;
        if let Some(context) = context {
            context.increment_document_read_count(documents.len());
        }
        documents.retain(|key, document| mutated_documents.contains(key) || query.matches(document));
        Ok(documents)
    }

    /// Estimated bytes of all cached documents.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(txn
            .get_as::<DbRemoteDocumentGlobal>(REMOTE_DOCUMENT_GLOBAL, &db_key![GLOBAL_KEY])?
            .unwrap_or_default()
            .byte_size)
    }

    fn entry_size(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<i64> {
        let record: Option<DbRemoteDocument> =
            txn.get_as(REMOTE_DOCUMENTS, &remote_document_key(key.path()))?;
        Ok(record.map(|record| record.byte_size as i64).unwrap_or(0))
    }

    fn adjust_size(&self, txn: &mut PersistenceTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global: DbRemoteDocumentGlobal = txn
            .get_as(REMOTE_DOCUMENT_GLOBAL, &db_key![GLOBAL_KEY])?
            .unwrap_or_default();
        global.byte_size += delta;
        txn.put_as(REMOTE_DOCUMENT_GLOBAL, db_key![GLOBAL_KEY], &global)
    }
}
