use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, FieldMask, IndexOffset,
    MutableDocument, MutableDocumentMap, MutationMap, OverlayMap, OverlayedDocument, Timestamp,
};

/// Local view of documents: the remote cache with pending writes applied
/// through overlays.
#[derive(Debug)]
pub struct LocalDocumentsView {
    remote_documents: Arc<RemoteDocumentCache>,
    mutation_queue: Arc<MutationQueue>,
    overlays: Arc<DocumentOverlayCache>,
    index_manager: Arc<IndexManager>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Arc<RemoteDocumentCache>,
        mutation_queue: Arc<MutationQueue>,
        overlays: Arc<DocumentOverlayCache>,
        index_manager: Arc<IndexManager>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn document_overlay_cache(&self) -> &DocumentOverlayCache {
        &self.overlays
    }

    pub fn remote_document_cache(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    /// The local view of `key`; an invalid document if nothing is known.
    pub fn get_document(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        let overlay = self.overlays.get_overlay(txn, key)?;
        // A full overlay does not depend on the remote state.
        let mut document = match &overlay {
            Some(overlay) if !overlay.mutation.is_patch() => {
                MutableDocument::new_invalid_document(key.clone())
            }
            _ => self.remote_documents.get_entry(txn, key)?,
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<MutableDocumentMap> {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, documents, &DocumentKeySet::new())
    }

    /// Applies overlays to already-read remote documents.
    /// `existence_state_changed` lists keys whose remote existence flipped;
    /// their patch overlays are recalculated from the mutation queue.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<MutableDocumentMap> {
        let overlays = self.overlays.get_overlays(txn, documents.keys())?;
        Ok(self
            .compute_views(txn, documents, overlays, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents)
    /// but also reports the fields each overlay changed.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, overlays, &DocumentKeySet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: MutableDocumentMap,
        overlays: OverlayMap,
        existence_state_changed: &DocumentKeySet,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let now = Timestamp::now();
        let mut recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let recalculate_patch =
                overlay.map_or(true, |overlay| overlay.mutation.is_patch());
            if existence_state_changed.contains(key) && recalculate_patch {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                overlay
                    .mutation
                    .apply_to_local_view(document, mask.clone(), now);
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        if !recalculate.is_empty() {
            let masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
            mutated_fields.extend(masks);
            documents.extend(recalculate);
        }

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).unwrap_or(None);
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Rebuilds the overlays of `documents` by replaying every pending batch
    /// that touches them. Documents are left in their local view state.
    /// Returns the changed-field mask per document.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut MutableDocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, documents.keys())?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<i32, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        // The newest batch touching a key owns its overlay.
        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in keys_by_batch.iter().rev() {
            let mut overlays = MutationMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                if let Some(document) = documents.get(key) {
                    let mask = masks.get(key).cloned().unwrap_or(None);
                    let overlay = calculate_overlay_mutation(document, mask.as_ref());
                    overlays.insert(key.clone(), overlay);
                }
            }
            self.overlays.save_overlays(txn, *batch_id, &overlays)?;
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Documents matching `query` in the local view, considering remote
    /// entries read after `offset` and overlays of later batches.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut result = MutableDocumentMap::new();
            if document.is_found_document() {
                result.insert(key, document);
            }
            Ok(result)
        } else if let Some(group) = query.collection_group_id() {
            let mut result = MutableDocumentMap::new();
            for parent in self.index_manager.get_collection_parents(txn, group)? {
                let collection_query = query.as_collection_query_at_path(parent.child([group]));
                result.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    offset,
                    context.as_deref_mut(),
                )?);
            }
            Ok(result)
        } else {
            self.get_documents_matching_collection_query(txn, query, offset, context)
        }
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> FirestoreResult<MutableDocumentMap> {
        let overlays =
            self.overlays
                .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id)?;
        let mutated: DocumentKeySet = overlays.keys().cloned().collect();
        let mut documents =
            self.remote_documents
                .get_documents_matching_query(txn, query, offset, &mutated, context)?;

        let now = Timestamp::now();
        for (key, overlay) in &overlays {
            if !documents.contains_key(key) {
                // Outside the offset window, or not cached at all.
                let base = self.remote_documents.get_entry(txn, key)?;
                documents.insert(key.clone(), base);
            }
            if let Some(document) = documents.get_mut(key) {
                overlay
                    .mutation
                    .apply_to_local_view(document, Some(FieldMask::empty()), now);
            }
        }
        documents.retain(|_, document| query.matches(document));
        Ok(documents)
    }
}
