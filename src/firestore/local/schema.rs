use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db_key;
use crate::firestore::error::{data_loss, failed_precondition, FirestoreResult};
use crate::firestore::local::simple_db::{DbKey, KeyPart, StoreData};
use crate::firestore::model::{MutableDocument, Mutation, ResourcePath, SnapshotVersion};
use crate::firestore::value::{BytesValue, FirestoreValue};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 3;

pub const MUTATION_QUEUES: &str = "mutation_queues";
pub const MUTATIONS: &str = "mutations";
pub const DOCUMENT_MUTATIONS: &str = "document_mutations";
pub const REMOTE_DOCUMENTS: &str = "remote_documents";
pub const REMOTE_DOCUMENT_GLOBAL: &str = "remote_document_global";
pub const TARGETS: &str = "targets";
pub const TARGET_DOCUMENTS: &str = "target_documents";
pub const TARGET_GLOBALS: &str = "target_globals";
pub const COLLECTION_PARENTS: &str = "collection_parents";
pub const INDEX_CONFIGURATION: &str = "index_configuration";
pub const INDEX_STATE: &str = "index_state";
pub const INDEX_ENTRIES: &str = "index_entries";
pub const BUNDLES: &str = "bundles";
pub const NAMED_QUERIES: &str = "named_queries";
pub const DOCUMENT_OVERLAYS: &str = "document_overlays";
pub const GLOBALS: &str = "globals";

/// Key of the single row in singleton stores.
pub const GLOBAL_KEY: &str = "global";
pub const OWNER_KEY: &str = "owner";
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

const V1_STORES: &[&str] = &[
    MUTATION_QUEUES,
    MUTATIONS,
    DOCUMENT_MUTATIONS,
    REMOTE_DOCUMENTS,
    TARGETS,
    TARGET_DOCUMENTS,
    TARGET_GLOBALS,
    BUNDLES,
    NAMED_QUERIES,
    GLOBALS,
];
const V2_STORES: &[&str] = &[DOCUMENT_OVERLAYS, COLLECTION_PARENTS, REMOTE_DOCUMENT_GLOBAL];
const V3_STORES: &[&str] = &[INDEX_CONFIGURATION, INDEX_STATE, INDEX_ENTRIES];

/// Per-user mutation queue metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbMutationQueue {
    pub last_acknowledged_batch_id: i32,
    pub last_stream_token: BytesValue,
    /// Id for the next batch. Never decreases, so ids are never reused.
    pub next_batch_id: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocument {
    pub document: MutableDocument,
    pub byte_size: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetGlobal {
    pub highest_target_id: i32,
    pub highest_listen_sequence_number: i64,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: u64,
}

/// Row of the target/document association table. Rows of the LRU sentinel
/// target carry the document's last-used sequence number.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetDocument {
    pub sequence_number: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbOwner {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbDocumentOverlay {
    pub largest_batch_id: i32,
    pub collection_group: String,
    pub mutation: Mutation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbIndexEntry {
    pub values: Vec<FirestoreValue>,
}

pub fn remote_document_key(path: &ResourcePath) -> DbKey {
    db_key![
        path.without_last().canonical_string(),
        path.last_segment().unwrap_or_default()
    ]
}

pub fn collection_parent_key(collection_id: &str, parent: &ResourcePath) -> DbKey {
    db_key![collection_id, parent.canonical_string()]
}

/// Reads the on-disk schema version, `0` for a fresh database.
pub fn read_schema_version(data: &StoreData) -> FirestoreResult<u32> {
    let raw = data
        .get(GLOBALS)
        .and_then(|store| store.get(&db_key![SCHEMA_VERSION_KEY]));
    match raw {
        None => Ok(0),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| data_loss(format!("Invalid schema version record: {err}"))),
    }
}

type MigrationStep = fn(&mut StoreData) -> FirestoreResult<()>;

/// Ordered upgrade steps keyed by `(from, to)`. Each step is idempotent so an
/// interrupted upgrade can be re-run.
const MIGRATIONS: &[(u32, u32, MigrationStep)] = &[
    (0, 1, create_v1_stores),
    (1, 2, add_overlays_and_backfill),
    (2, 3, create_index_stores),
];

/// Brings `data` up to [`SCHEMA_VERSION`]. Returns whether anything changed.
pub fn migrate(data: &mut StoreData) -> FirestoreResult<bool> {
    let from = read_schema_version(data)?;
    if from > SCHEMA_VERSION {
        return Err(failed_precondition(format!(
            "The persisted data has schema version {from}, newer than the supported version \
             {SCHEMA_VERSION}. Clear persistence or upgrade the client."
        )));
    }
    if from == SCHEMA_VERSION {
        return Ok(false);
    }
    for (step_from, step_to, step) in MIGRATIONS {
        if *step_from >= from && *step_to <= SCHEMA_VERSION {
            log::debug!("running schema migration {step_from} -> {step_to}");
            step(data)?;
        }
    }
    data.entry(GLOBALS.to_string())
        .or_default()
        .insert(db_key![SCHEMA_VERSION_KEY], Value::from(SCHEMA_VERSION));
    Ok(true)
}

fn ensure_stores(data: &mut StoreData, stores: &[&str]) {
    for store in stores {
        data.entry(store.to_string()).or_default();
    }
}

fn create_v1_stores(data: &mut StoreData) -> FirestoreResult<()> {
    ensure_stores(data, V1_STORES);
    Ok(())
}

/// Adds the overlay stores and backfills collection parents and the remote
/// document size total from existing rows.
fn add_overlays_and_backfill(data: &mut StoreData) -> FirestoreResult<()> {
    ensure_stores(data, V2_STORES);

    let mut parents: Vec<DbKey> = Vec::new();
    let mut total_size: i64 = 0;
    if let Some(remote) = data.get(REMOTE_DOCUMENTS) {
        for (key, value) in remote {
            if let Some(collection) = key.first().and_then(KeyPart::as_str) {
                parents.extend(parent_row(collection)?);
            }
            let record: DbRemoteDocument = serde_json::from_value(value.clone())
                .map_err(|err| data_loss(format!("Invalid remote document record: {err}")))?;
            total_size += record.byte_size as i64;
        }
    }
    if let Some(document_mutations) = data.get(DOCUMENT_MUTATIONS) {
        for key in document_mutations.keys() {
            if let Some(path) = key.get(1).and_then(KeyPart::as_str) {
                let path = ResourcePath::from_string(path)?;
                parents.extend(parent_row(&path.without_last().canonical_string())?);
            }
        }
    }

    let parents_store = data.entry(COLLECTION_PARENTS.to_string()).or_default();
    for key in parents {
        parents_store.entry(key).or_insert(Value::Null);
    }
    let global = DbRemoteDocumentGlobal {
        byte_size: total_size,
    };
    let global = serde_json::to_value(global)
        .map_err(|err| data_loss(format!("Failed to encode size record: {err}")))?;
    data.entry(REMOTE_DOCUMENT_GLOBAL.to_string())
        .or_default()
        .insert(db_key![GLOBAL_KEY], global);
    Ok(())
}

fn parent_row(collection_path: &str) -> FirestoreResult<Option<DbKey>> {
    let path = ResourcePath::from_string(collection_path)?;
    Ok(path
        .last_segment()
        .map(|collection_id| collection_parent_key(collection_id, &path.without_last())))
}

fn create_index_stores(data: &mut StoreData) -> FirestoreResult<()> {
    ensure_stores(data, V3_STORES);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DocumentKey;

    #[test]
    fn fresh_database_migrates_to_current_version() {
        let mut data = StoreData::new();
        assert!(migrate(&mut data).unwrap());
        assert_eq!(read_schema_version(&data).unwrap(), SCHEMA_VERSION);
        for store in V1_STORES.iter().chain(V2_STORES).chain(V3_STORES) {
            assert!(data.contains_key(*store), "missing store {store}");
        }
        assert!(!migrate(&mut data).unwrap());
    }

    #[test]
    fn v1_upgrade_backfills_parents_and_sizes() {
        let mut data = StoreData::new();
        create_v1_stores(&mut data).unwrap();
        data.get_mut(GLOBALS)
            .unwrap()
            .insert(db_key![SCHEMA_VERSION_KEY], Value::from(1));
        let key = DocumentKey::from_string("rooms/a/messages/m1").unwrap();
        let record = DbRemoteDocument {
            document: MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            byte_size: 42,
        };
        data.get_mut(REMOTE_DOCUMENTS).unwrap().insert(
            remote_document_key(key.path()),
            serde_json::to_value(record).unwrap(),
        );

        migrate(&mut data).unwrap();
        // Running the step again must not change anything.
        let snapshot = data.clone();
        add_overlays_and_backfill(&mut data).unwrap();
        assert_eq!(snapshot, data);

        let parents = &data[COLLECTION_PARENTS];
        assert!(parents.contains_key(&db_key!["messages", "rooms/a"]));
        let global: DbRemoteDocumentGlobal =
            serde_json::from_value(data[REMOTE_DOCUMENT_GLOBAL][&db_key![GLOBAL_KEY]].clone())
                .unwrap();
        assert_eq!(global.byte_size, 42);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut data = StoreData::new();
        data.entry(GLOBALS.to_string())
            .or_default()
            .insert(db_key![SCHEMA_VERSION_KEY], Value::from(SCHEMA_VERSION + 1));
        let err = migrate(&mut data).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }
}
