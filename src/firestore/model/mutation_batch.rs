use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    OverlayedDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::BytesValue;
use crate::util::assert::hard_assert;

/// An atomic group of local writes with a single id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Patches recording base values for non-idempotent transforms. Applied
    /// to the local view only, never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "Cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged mutations of this batch that target
    /// `document`'s key.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        let results = &batch_result.mutation_results;
        hard_assert(
            results.len() == self.mutations.len(),
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            ),
        );
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    /// Applies the batch to the local view of `document` and returns the
    /// accumulated changed-field mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        // Base mutations first, so transforms see their recorded base values.
        for mutation in &self.base_mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document in `documents` and returns
    /// the overlay each affected key should now carry (`None` = no overlay).
    ///
    /// Keys in `documents_without_remote_version` get whole-document overlays
    /// since no remote base exists to patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Option<Mutation>> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let key = mutation.key();
            let overlayed = match documents.get_mut(key) {
                Some(overlayed) => overlayed,
                None => continue,
            };
            let mutated_fields = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.take(),
            );
            overlayed.mutated_fields = mutated_fields.clone();
            let mutated_fields = if documents_without_remote_version.contains(key) {
                None
            } else {
                mutated_fields
            };
            let overlay = calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref());
            if overlay.is_some() {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }
}

/// Server acknowledgement of a whole batch.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: BytesValue,
    /// Committed version per written key.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: BytesValue,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, MutationKind, Precondition};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated(field).unwrap(), value.into());
        map
    }

    #[test]
    fn local_document_set_produces_overlays_per_key() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![
                Mutation::set(key("rooms/a"), data("n", 1)),
                Mutation::patch(
                    key("rooms/b"),
                    data("n", 2),
                    FieldMask::new([FieldPath::from_dot_separated("n").unwrap()]),
                    Precondition::Exists(true),
                ),
            ],
        );
        let mut documents = BTreeMap::new();
        for path in ["rooms/a", "rooms/b"] {
            documents.insert(
                key(path),
                OverlayedDocument::new(MutableDocument::new_invalid_document(key(path)), None),
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());

        let overlay_a = overlays.get(&key("rooms/a")).cloned().flatten().unwrap();
        assert!(matches!(overlay_a.kind(), MutationKind::Set { .. }));
        // The patch failed its precondition, so rooms/b has no overlay and
        // becomes a synthetic missing document.
        assert!(!overlays.contains_key(&key("rooms/b")));
        assert!(documents[&key("rooms/b")].document.is_no_document());
        assert_eq!(
            documents[&key("rooms/a")].document.field(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&FirestoreValue::from_integer(1))
        );
    }

    #[test]
    fn batch_result_tracks_versions() {
        let batch = MutationBatch::new(
            7,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::delete(key("rooms/a"))],
        );
        let version = SnapshotVersion::new(Timestamp::new(9, 0));
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, Vec::new())],
            BytesValue::empty(),
        );
        assert_eq!(result.doc_versions.get(&key("rooms/a")), Some(&version));
    }
}
