mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::DatabaseId;
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexOffset, IndexSegment, IndexState};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_FIELD};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

use std::collections::{BTreeMap, BTreeSet};

pub type DocumentKeySet = BTreeSet<DocumentKey>;
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;
/// Per-key overlay mutation, `None` meaning "remove the overlay".
pub type MutationMap = BTreeMap<DocumentKey, Option<Mutation>>;
