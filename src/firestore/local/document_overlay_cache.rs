use std::collections::BTreeMap;

use crate::db_key;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{DbDocumentOverlay, DOCUMENT_OVERLAYS};
use crate::firestore::local::simple_db::DbKey;
use crate::firestore::model::{DocumentKey, MutationMap, Overlay, OverlayMap, ResourcePath};

/// Per-user overlays: the single mutation per document that summarizes all
/// of its pending local writes.
#[derive(Debug)]
pub struct DocumentOverlayCache {
    user_id: String,
}

impl DocumentOverlayCache {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    fn row_key(&self, key: &DocumentKey) -> DbKey {
        db_key![&self.user_id, key.collection_path().canonical_string(), key.id()]
    }

    pub fn get_overlay(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        let record: Option<DbDocumentOverlay> = txn.get_as(DOCUMENT_OVERLAYS, &self.row_key(key))?;
        Ok(record.map(|record| Overlay::new(record.largest_batch_id, record.mutation)))
    }

    pub fn get_overlays<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<OverlayMap> {
        let mut overlays = OverlayMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Writes the overlays produced by batch `largest_batch_id`. A `None`
    /// entry removes the key's overlay.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: i32,
        overlays: &MutationMap,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            match mutation {
                Some(mutation) => txn.put_as(
                    DOCUMENT_OVERLAYS,
                    self.row_key(key),
                    &DbDocumentOverlay {
                        largest_batch_id,
                        collection_group: key.collection_group().to_string(),
                        mutation: mutation.clone(),
                    },
                )?,
                None => txn.delete(DOCUMENT_OVERLAYS, self.row_key(key)),
            }
        }
        Ok(())
    }

    /// Drops the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        batch_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                if overlay.largest_batch_id == batch_id {
                    txn.delete(DOCUMENT_OVERLAYS, self.row_key(key));
                }
            }
        }
        Ok(())
    }

    /// Overlays of documents directly in `collection` changed by batches
    /// after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> FirestoreResult<OverlayMap> {
        let prefix = db_key![&self.user_id, collection.canonical_string()];
        Ok(txn
            .scan_as::<DbDocumentOverlay>(DOCUMENT_OVERLAYS, &prefix)?
            .into_iter()
            .filter(|(_, record)| record.largest_batch_id > since_batch_id)
            .map(|(_, record)| {
                let overlay = Overlay::new(record.largest_batch_id, record.mutation);
                (overlay.key().clone(), overlay)
            })
            .collect())
    }

    /// Overlays in `collection_group` written after `since_batch_id`, in
    /// batch order. Whole batches are returned, so the result may exceed
    /// `count`.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> FirestoreResult<OverlayMap> {
        let mut by_batch: BTreeMap<i32, Vec<Overlay>> = BTreeMap::new();
        for (_, record) in txn.scan_as::<DbDocumentOverlay>(DOCUMENT_OVERLAYS, &db_key![&self.user_id])? {
            if record.collection_group == collection_group && record.largest_batch_id > since_batch_id {
                by_batch
                    .entry(record.largest_batch_id)
                    .or_default()
                    .push(Overlay::new(record.largest_batch_id, record.mutation));
            }
        }
        let mut overlays = OverlayMap::new();
        for batch in by_batch.into_values() {
            if overlays.len() >= count {
                break;
            }
            for overlay in batch {
                overlays.insert(overlay.key().clone(), overlay);
            }
        }
        Ok(overlays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::Mutation;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(paths: &[&str]) -> MutationMap {
        paths
            .iter()
            .map(|path| (key(path), Some(Mutation::delete(key(path)))))
            .collect()
    }

    #[tokio::test]
    async fn removal_is_scoped_to_the_writing_batch() {
        let persistence = Persistence::memory("client").unwrap();
        let cache = DocumentOverlayCache::new("alice");
        persistence
            .run_transaction("overlays", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a", "rooms/b"]))?;
                cache.save_overlays(txn, 2, &overlays(&["rooms/b"]))?;
                cache.remove_overlays_for_batch_id(txn, [&key("rooms/a"), &key("rooms/b")], 1)?;
                assert!(cache.get_overlay(txn, &key("rooms/a"))?.is_none());
                assert_eq!(cache.get_overlay(txn, &key("rooms/b"))?.unwrap().largest_batch_id, 2);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn collection_and_group_scans() {
        let persistence = Persistence::memory("client").unwrap();
        let cache = DocumentOverlayCache::new("alice");
        let other_user = DocumentOverlayCache::new("bob");
        persistence
            .run_transaction("scans", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a/messages/1"]))?;
                cache.save_overlays(txn, 2, &overlays(&["rooms/b/messages/2", "rooms/b/messages/3"]))?;
                cache.save_overlays(txn, 3, &overlays(&["rooms/c/messages/4"]))?;
                other_user.save_overlays(txn, 1, &overlays(&["rooms/a/messages/9"]))?;

                let collection = ResourcePath::from_string("rooms/a/messages").unwrap();
                assert_eq!(cache.get_overlays_for_collection(txn, &collection, 0)?.len(), 1);
                assert!(cache.get_overlays_for_collection(txn, &collection, 1)?.is_empty());

                let group = cache.get_overlays_for_collection_group(txn, "messages", 0, 2)?;
                assert_eq!(group.len(), 3);
                let group = cache.get_overlays_for_collection_group(txn, "messages", 1, 100)?;
                assert_eq!(group.len(), 3);
                Ok(())
            })
            .await
            .unwrap();
    }
}
