use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::db_key;
use crate::firestore::constants::LRU_SENTINEL_TARGET_ID;
use crate::firestore::core::target::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    DbTargetDocument, DbTargetGlobal, GLOBAL_KEY, TARGETS, TARGET_DOCUMENTS, TARGET_GLOBALS,
};
use crate::firestore::local::simple_db::{DbKey, KeyPart};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};
use crate::util::assert::hard_assert;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DbTarget {
    canonical_id: String,
    target_data: TargetData,
}

/// Persisted targets, their document associations and the LRU sentinel rows.
///
/// `target_documents` rows are keyed `[target_id, path]`. Rows of target
/// [`LRU_SENTINEL_TARGET_ID`] record the sequence number at which a document
/// was last referenced, so it can be collected once no target holds it.
#[derive(Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    fn globals(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn
            .get_as(TARGET_GLOBALS, &db_key![GLOBAL_KEY])?
            .unwrap_or_default())
    }

    fn save_globals(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        globals: &DbTargetGlobal,
    ) -> FirestoreResult<()> {
        txn.put_as(TARGET_GLOBALS, db_key![GLOBAL_KEY], globals)
    }

    /// Seed for the target id generator.
    pub fn get_highest_target_id(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i32> {
        Ok(self.globals(txn)?.highest_target_id)
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(self.globals(txn)?.highest_listen_sequence_number)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(self.globals(txn)?.last_remote_snapshot_version)
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut globals = self.globals(txn)?;
        globals.last_remote_snapshot_version = version;
        self.save_globals(txn, &globals)
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<u64> {
        Ok(self.globals(txn)?.target_count)
    }

    /// Stores a target that is not yet in the cache.
    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut globals = self.globals(txn)?;
        globals.target_count += 1;
        globals.highest_target_id = globals.highest_target_id.max(target_data.target_id);
        globals.highest_listen_sequence_number = globals
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        self.save_globals(txn, &globals)
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)
    }

    fn save_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        txn.put_as(
            TARGETS,
            db_key![target_data.target_id],
            &DbTarget {
                canonical_id: target_data.target.canonical_id(),
                target_data: target_data.clone(),
            },
        )
    }

    /// Removes the target and its document associations. The orphaned
    /// documents get fresh sentinel rows.
    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.delete(TARGETS, db_key![target_data.target_id]);
        let mut globals = self.globals(txn)?;
        hard_assert(globals.target_count > 0, "Removing a target from an empty target cache");
        globals.target_count -= 1;
        self.save_globals(txn, &globals)
    }

    /// Removes every target last used at or before `upper_bound` that is not
    /// in `active_target_ids`. Returns how many were removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: i64,
        active_target_ids: &BTreeSet<i32>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.get_all_target_data(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// The cached data for `target`, if it was ever allocated.
    pub fn get_target_data(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        Ok(txn
            .scan_as::<DbTarget>(TARGETS, &[])?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.canonical_id == canonical_id && &record.target_data.target == target)
            .map(|record| record.target_data))
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: i32,
    ) -> FirestoreResult<Option<TargetData>> {
        let record: Option<DbTarget> = txn.get_as(TARGETS, &db_key![target_id])?;
        Ok(record.map(|record| record.target_data))
    }

    pub fn get_all_target_data(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan_as::<DbTarget>(TARGETS, &[])?
            .into_iter()
            .map(|(_, record)| record.target_data)
            .collect())
    }

    pub fn add_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.put_as(
                TARGET_DOCUMENTS,
                association_key(target_id, key),
                &DbTargetDocument::default(),
            )?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(TARGET_DOCUMENTS, association_key(target_id, key));
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        let keys = self.get_matching_keys_for_target_id(txn, target_id)?;
        self.remove_matching_keys(txn, &keys, target_id)
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: i32,
    ) -> FirestoreResult<DocumentKeySet> {
        txn.scan_keys(TARGET_DOCUMENTS, &db_key![target_id])
            .iter()
            .filter_map(|row| row.get(1).and_then(KeyPart::as_str))
            .map(DocumentKey::from_string)
            .collect()
    }

    /// Whether any real target references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        let path = key.path().canonical_string();
        txn.scan_keys(TARGET_DOCUMENTS, &[]).iter().any(|row| {
            row.first().and_then(KeyPart::as_int) != Some(LRU_SENTINEL_TARGET_ID as i64)
                && row.get(1).and_then(KeyPart::as_str) == Some(path.as_str())
        })
    }

    /// Stamps `key`'s sentinel row with the transaction's sequence number.
    pub fn update_sentinel(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number();
        txn.put_as(
            TARGET_DOCUMENTS,
            association_key(LRU_SENTINEL_TARGET_ID, key),
            &DbTargetDocument {
                sequence_number: Some(sequence_number),
            },
        )
    }

    pub fn remove_sentinel(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        txn.delete(TARGET_DOCUMENTS, association_key(LRU_SENTINEL_TARGET_ID, key));
    }

    /// Documents with a sentinel row but no target association, with their
    /// last-used sequence numbers.
    pub fn get_orphaned_documents(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<(DocumentKey, i64)>> {
        let mut sentinels: BTreeMap<String, i64> = BTreeMap::new();
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for (row, record) in txn.scan_as::<DbTargetDocument>(TARGET_DOCUMENTS, &[])? {
            let (Some(target_id), Some(path)) = (
                row.first().and_then(KeyPart::as_int),
                row.get(1).and_then(KeyPart::as_str),
            ) else {
                continue;
            };
            if target_id == LRU_SENTINEL_TARGET_ID as i64 {
                sentinels.insert(path.to_string(), record.sequence_number.unwrap_or_default());
            } else {
                referenced.insert(path.to_string());
            }
        }
        sentinels
            .into_iter()
            .filter(|(path, _)| !referenced.contains(path))
            .map(|(path, sequence_number)| {
                DocumentKey::from_string(&path).map(|key| (key, sequence_number))
            })
            .collect()
    }
}

fn association_key(target_id: i32, key: &DocumentKey) -> DbKey {
    db_key![target_id, key.path().canonical_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::target_data::QueryPurpose;
    use crate::firestore::model::ResourcePath;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn target_data(collection: &str, target_id: i32, sequence_number: i64) -> TargetData {
        let target = Query::new(ResourcePath::from_string(collection).unwrap()).listen_target();
        TargetData::new(target, target_id, QueryPurpose::Listen, sequence_number)
    }

    #[tokio::test]
    async fn targets_round_trip_and_update_globals() {
        let persistence = Persistence::memory("client").unwrap();
        let cache = TargetCache::new();
        persistence
            .run_transaction("targets", TransactionMode::ReadWrite, |txn| {
                let rooms = target_data("rooms", 2, 10);
                cache.add_target_data(txn, &rooms)?;
                cache.add_target_data(txn, &target_data("users", 4, 11))?;
                assert_eq!(cache.get_highest_target_id(txn)?, 4);
                assert_eq!(cache.get_target_count(txn)?, 2);
                assert_eq!(cache.get_target_data(txn, &rooms.target)?, Some(rooms.clone()));

                cache.remove_target_data(txn, &rooms)?;
                assert!(cache.get_target_data(txn, &rooms.target)?.is_none());
                assert_eq!(cache.get_target_count(txn)?, 1);
                assert_eq!(cache.get_highest_target_id(txn)?, 4);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removed_associations_leave_orphans() {
        let persistence = Persistence::memory("client").unwrap();
        let cache = TargetCache::new();
        persistence
            .run_transaction("orphans", TransactionMode::ReadWrite, |txn| {
                let rooms = target_data("rooms", 2, 1);
                cache.add_target_data(txn, &rooms)?;
                cache.add_matching_keys(txn, [&key("rooms/a"), &key("rooms/b")], 2)?;
                assert!(cache.contains_key(txn, &key("rooms/a")));
                assert!(cache.get_orphaned_documents(txn)?.is_empty());

                cache.remove_matching_keys(txn, [&key("rooms/a")], 2)?;
                assert!(!cache.contains_key(txn, &key("rooms/a")));
                let orphans: Vec<DocumentKey> = cache
                    .get_orphaned_documents(txn)?
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                assert_eq!(orphans, vec![key("rooms/a")]);

                let active: BTreeSet<i32> = BTreeSet::new();
                assert_eq!(cache.remove_targets(txn, 1, &active)?, 1);
                assert_eq!(cache.get_orphaned_documents(txn)?.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }
}
