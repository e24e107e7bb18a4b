use std::collections::BTreeSet;

use serde_json::Value;

use crate::db_key;
use crate::firestore::core::target::{Direction, FilterOperator, Target};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_parent_key, DbIndexEntry, COLLECTION_PARENTS, INDEX_CONFIGURATION, INDEX_ENTRIES,
    INDEX_STATE,
};
use crate::firestore::local::simple_db::KeyPart;
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment, IndexState,
    MutableDocument, MutableDocumentMap, ResourcePath, SnapshotVersion,
};
use crate::firestore::value::{FirestoreValue, MapValue};

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    /// An index covers some, but not all, constrained fields. Results must be
    /// post-filtered.
    Partial,
    Full,
}

/// Maintains the collection-parent index and client-side field indexes.
///
/// Index entries hold the indexed field values of remote documents only;
/// pending writes are merged in by the query engine through overlays.
#[derive(Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Records that documents exist under `collection_path`. Needed to run
    /// collection group queries over the cache.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_path: &ResourcePath,
    ) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        let key = collection_parent_key(collection_id, &collection_path.without_last());
        if txn.get(COLLECTION_PARENTS, &key).is_none() {
            txn.put(COLLECTION_PARENTS, key, Value::Null);
        }
    }

    /// Every parent path under which a collection named `collection_id`
    /// holds documents.
    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        txn.scan_keys(COLLECTION_PARENTS, &db_key![collection_id])
            .iter()
            .filter_map(|key| key.get(1).and_then(KeyPart::as_str))
            .map(ResourcePath::from_string)
            .collect()
    }

    /// Stores `index` under a fresh id and returns it as stored.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        index: &FieldIndex,
    ) -> FirestoreResult<FieldIndex> {
        let next_id = txn
            .scan_keys(INDEX_CONFIGURATION, &[])
            .last()
            .and_then(|key| key.first().and_then(KeyPart::as_int))
            .map(|id| id as i32 + 1)
            .unwrap_or(1);
        let mut stored = index.clone();
        stored.index_id = next_id;
        stored.state = IndexState::default();
        txn.put_as(INDEX_CONFIGURATION, db_key![next_id], &stored)?;
        txn.put_as(INDEX_STATE, db_key![next_id], &stored.state)?;
        log::debug!(
            "created field index {} on collection group '{}'",
            next_id,
            stored.collection_group
        );
        Ok(stored)
    }

    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32) {
        txn.delete(INDEX_CONFIGURATION, db_key![index_id]);
        txn.delete(INDEX_STATE, db_key![index_id]);
        txn.delete_prefix(INDEX_ENTRIES, &db_key![index_id]);
    }

    pub fn delete_all_field_indexes(&self, txn: &mut PersistenceTransaction<'_>) {
        txn.delete_prefix(INDEX_CONFIGURATION, &[]);
        txn.delete_prefix(INDEX_STATE, &[]);
        txn.delete_prefix(INDEX_ENTRIES, &[]);
    }

    /// Indexes for `collection_group`, or every index when `None`.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        let mut indexes = Vec::new();
        for (key, mut index) in txn.scan_as::<FieldIndex>(INDEX_CONFIGURATION, &[])? {
            if collection_group.map_or(false, |group| group != index.collection_group) {
                continue;
            }
            index.state = txn.get_as(INDEX_STATE, &key)?.unwrap_or_default();
            indexes.push(index);
        }
        Ok(indexes)
    }

    /// The index serving the most of `target`'s constrained fields.
    pub fn get_field_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<FieldIndex>> {
        let Some(group) = target_collection_group(target) else {
            return Ok(None);
        };
        Ok(self
            .get_field_indexes(txn, Some(&group))?
            .into_iter()
            .filter(|index| serves_target(index, target))
            .max_by_key(|index| index.segments.len()))
    }

    pub fn get_index_type(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<IndexType> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(IndexType::None);
        };
        let indexed: BTreeSet<&FieldPath> =
            index.segments.iter().map(|segment| &segment.field_path).collect();
        let covered = target
            .constrained_fields()
            .iter()
            .all(|field| indexed.contains(field));
        Ok(if covered { IndexType::Full } else { IndexType::Partial })
    }

    /// Keys of indexed documents satisfying the target's filters on indexed
    /// fields, or `None` without a usable index. Filters on other fields are
    /// left to the caller.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<Vec<DocumentKey>>> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(None);
        };
        let indexed: BTreeSet<&FieldPath> =
            index.segments.iter().map(|segment| &segment.field_path).collect();
        let filters: Vec<_> = target
            .filters
            .iter()
            .filter(|filter| filter.field().is_key_field() || indexed.contains(filter.field()))
            .collect();

        let mut keys = Vec::new();
        for (row, entry) in txn.scan_as::<DbIndexEntry>(INDEX_ENTRIES, &db_key![index.index_id])? {
            let Some(path) = row.get(1).and_then(KeyPart::as_str) else {
                continue;
            };
            let key = DocumentKey::from_string(path)?;
            if !is_within_target_path(target, &key) {
                continue;
            }
            let candidate = entry_document(&index, key, entry.values);
            if filters.iter().all(|filter| filter.matches(&candidate)) {
                keys.push(candidate.key().clone());
            }
        }
        Ok(Some(keys))
    }

    /// Lowest backfill offset across the indexes serving `target`.
    pub fn get_min_offset(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<IndexOffset> {
        match target_collection_group(target) {
            Some(group) => self.get_min_offset_for_collection_group(txn, &group),
            None => Ok(IndexOffset::none()),
        }
    }

    pub fn get_min_offset_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
    ) -> FirestoreResult<IndexOffset> {
        Ok(self
            .get_field_indexes(txn, Some(collection_group))?
            .into_iter()
            .map(|index| index.state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none))
    }

    /// Collection group whose indexes were backfilled least recently.
    pub fn get_next_collection_group_to_update(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Option<String>> {
        Ok(self
            .get_field_indexes(txn, None)?
            .into_iter()
            .min_by_key(|index| (index.state.sequence_number, index.index_id))
            .map(|index| index.collection_group))
    }

    /// Marks every index of `collection_group` as backfilled up to `offset`.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
    ) -> FirestoreResult<()> {
        let all = self.get_field_indexes(txn, None)?;
        let sequence_number = all
            .iter()
            .map(|index| index.state.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        for index in all.iter().filter(|index| index.collection_group == collection_group) {
            let state = IndexState {
                sequence_number,
                offset: offset.clone(),
            };
            txn.put_as(INDEX_STATE, db_key![index.index_id], &state)?;
        }
        Ok(())
    }

    /// Rewrites the index entries of `documents` in every index of their
    /// collection group. Missing and deleted documents lose their entries.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &MutableDocumentMap,
    ) -> FirestoreResult<()> {
        for (key, document) in documents {
            for index in self.get_field_indexes(txn, Some(key.collection_group()))? {
                let row = db_key![index.index_id, key.path().canonical_string()];
                match index_values(&index, document) {
                    Some(values) => txn.put_as(INDEX_ENTRIES, row, &DbIndexEntry { values })?,
                    None => txn.delete(INDEX_ENTRIES, row),
                }
            }
        }
        Ok(())
    }

    /// Creates an index serving `target` unless an equivalent one exists.
    pub fn create_target_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<()> {
        if self.get_index_type(txn, target)? == IndexType::Full {
            return Ok(());
        }
        let Some(index) = build_target_index(target) else {
            return Ok(());
        };
        let existing = self.get_field_indexes(txn, Some(&index.collection_group))?;
        if existing.iter().any(|other| other.same_definition(&index)) {
            return Ok(());
        }
        self.add_field_index(txn, &index)?;
        Ok(())
    }
}

fn target_collection_group(target: &Target) -> Option<String> {
    if target.is_document_target() {
        return None;
    }
    target
        .collection_group
        .clone()
        .or_else(|| target.path.last_segment().map(str::to_string))
}

fn is_within_target_path(target: &Target, key: &DocumentKey) -> bool {
    if target.collection_group.is_some() {
        target.path.is_prefix_of(key.path())
    } else {
        target.path.is_immediate_parent_of(key.path())
    }
}

fn is_equality(op: FilterOperator) -> bool {
    matches!(op, FilterOperator::Equal | FilterOperator::In)
}

fn is_array_operator(op: FilterOperator) -> bool {
    matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny)
}

fn direction_kind(direction: Direction) -> IndexKind {
    match direction {
        Direction::Ascending => IndexKind::Ascending,
        Direction::Descending => IndexKind::Descending,
    }
}

/// Whether `index` can be scanned for `target`: equality fields first in any
/// order, then the inequality field, then the remaining orderings in order.
fn serves_target(index: &FieldIndex, target: &Target) -> bool {
    if let Some(array_segment) = index.array_segment() {
        let served = target.filters.iter().any(|filter| {
            is_array_operator(filter.op()) && filter.field() == &array_segment.field_path
        });
        if !served {
            return false;
        }
    }

    let equality: BTreeSet<&FieldPath> = target
        .filters
        .iter()
        .filter(|filter| is_equality(filter.op()))
        .map(|filter| filter.field())
        .collect();
    let inequality = target
        .filters
        .iter()
        .find(|filter| filter.is_inequality())
        .map(|filter| filter.field());

    let segments: Vec<&IndexSegment> = index.directional_segments().collect();
    let mut position = 0;
    while position < segments.len() && equality.contains(&segments[position].field_path) {
        position += 1;
    }
    if position == segments.len() {
        return true;
    }

    let mut order_by = target
        .order_by
        .iter()
        .filter(|order| !order.field.is_key_field())
        .peekable();
    if let Some(field) = inequality {
        let segment = segments[position];
        if &segment.field_path != field {
            return false;
        }
        if let Some(order) = order_by.peek() {
            if &order.field == field && direction_kind(order.direction) != segment.kind {
                return false;
            }
            if &order.field == field {
                order_by.next();
            }
        }
        position += 1;
    }
    for order in order_by {
        if position == segments.len() {
            break;
        }
        let segment = segments[position];
        if segment.field_path != order.field || segment.kind != direction_kind(order.direction) {
            return false;
        }
        position += 1;
    }
    position == segments.len()
}

fn build_target_index(target: &Target) -> Option<FieldIndex> {
    let group = target_collection_group(target)?;
    let mut segments: Vec<IndexSegment> = Vec::new();
    let mut seen: BTreeSet<FieldPath> = BTreeSet::new();

    if let Some(filter) = target.filters.iter().find(|filter| is_array_operator(filter.op())) {
        segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Contains));
        seen.insert(filter.field().clone());
    }
    for filter in target.filters.iter().filter(|filter| is_equality(filter.op())) {
        if !filter.field().is_key_field() && seen.insert(filter.field().clone()) {
            segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Ascending));
        }
    }
    for order in &target.order_by {
        if !order.field.is_key_field() && seen.insert(order.field.clone()) {
            segments.push(IndexSegment::new(order.field.clone(), direction_kind(order.direction)));
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(FieldIndex::new(group, segments))
}

/// Indexed values of `document`, or `None` if it cannot appear in the index.
fn index_values(index: &FieldIndex, document: &MutableDocument) -> Option<Vec<FirestoreValue>> {
    if !document.is_found_document() {
        return None;
    }
    let mut values = Vec::with_capacity(index.segments.len());
    for segment in &index.segments {
        let value = document.field(&segment.field_path)?;
        if segment.kind == IndexKind::Contains && !value.is_array() {
            return None;
        }
        values.push(value.clone());
    }
    Some(values)
}

fn entry_document(index: &FieldIndex, key: DocumentKey, values: Vec<FirestoreValue>) -> MutableDocument {
    let mut data = MapValue::empty();
    for (segment, value) in index.segments.iter().zip(values) {
        data.set(&segment.field_path, value);
    }
    MutableDocument::new_found_document(key, SnapshotVersion::min(), data)
}
