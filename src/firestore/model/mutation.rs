use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};
use crate::util::assert::hard_assert;

/// Write-time transform applied to a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Latency-compensated result shown before the server has responded.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(coerce_to_array(previous).union(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_array(
                coerce_to_array(previous).remove_all(elements).values().to_vec(),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Final value once the server acknowledged the write. Array transforms
    /// are deterministic, so they are recomputed from the committed base.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            _ => transform_result.cloned().unwrap_or_else(FirestoreValue::null),
        }
    }

    /// Base value a non-idempotent transform must remember so it can be
    /// re-applied on top of later remote changes.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

fn coerce_to_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => {
            FirestoreValue::from_integer(a.saturating_add(*b))
        }
        (ValueKind::Integer(a), ValueKind::Double(b)) => FirestoreValue::from_double(*a as f64 + b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => FirestoreValue::from_double(a + *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => FirestoreValue::from_double(a + b),
        _ => operand.clone(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes only the fields named in `mask`; masked paths absent from
    /// `data` are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Asserts the precondition without writing. Only sent by transactions.
    Verify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Server acknowledgement of a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    /// One entry per field transform, in order. Empty when the mutation had
    /// no transforms.
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None, Vec::new())
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Patch { data, mask }, precondition, Vec::new())
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None, Vec::new())
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition, Vec::new())
    }

    pub fn new(
        key: DocumentKey,
        kind: MutationKind,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    ) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Fields this mutation writes, or `None` if it replaces the whole
    /// document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.clone()),
            _ => None,
        }
    }

    /// Applies this mutation to the last committed document using the
    /// server's result.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        self.verify_key(document);
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                data.set_all(transforms);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // Committed without a usable base: the server has a
                    // document we cannot reconstruct.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transforms = self.server_transform_results(document, &result.transform_results);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, mask));
                new_data.set_all(transforms);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies this mutation to the local view of `document` and returns the
    /// accumulated mask of changed fields, `None` meaning "whole document".
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key(document);
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_entries(data, mask));
                new_data.set_all(transforms);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                let mut merged = previous_mask?.union(mask);
                for transform in &self.field_transforms {
                    merged.insert(transform.field_path().clone());
                }
                Some(merged)
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Base values for the non-idempotent transforms of this mutation, or
    /// `None` if none of them need one.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        for transform in &self.field_transforms {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.set(transform.field_path(), value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                let value = transform
                    .operation()
                    .apply_to_local_view(previous, local_write_time);
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        hard_assert(
            results.is_empty() || results.len() == self.field_transforms.len(),
            format!(
                "server transform result count ({}) should match field transform count ({})",
                results.len(),
                self.field_transforms.len()
            ),
        );
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(transform.field_path());
                let value = transform
                    .operation()
                    .apply_to_remote_document(previous, results.get(index));
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }

    fn verify_key(&self, document: &MutableDocument) {
        hard_assert(
            document.key() == &self.key,
            format!(
                "Can only apply a mutation to a document with the same key ({} != {})",
                document.key(),
                self.key
            ),
        );
    }
}

fn patch_entries(data: &MapValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.iter()
        .map(|path| (path.clone(), data.get(path).cloned()))
        .collect()
}

/// Smallest mutation that turns the remote version of `document` into its
/// current local state, given the fields changed locally (`None` = all).
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let mask = match mask {
        None => {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        }
        Some(mask) if mask.is_empty() => return None,
        Some(mask) => mask,
    };

    let data = document.data();
    let mut patch_value = MapValue::empty();
    let mut mask_set = FieldMask::empty();
    for field in mask.iter() {
        if mask_set.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.get(&path);
        // A deleted nested field turns into a write of its parent map.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.get(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }
    Some(Mutation::patch(
        document.key().clone(),
        patch_value,
        mask_set,
        Precondition::None,
    ))
}
