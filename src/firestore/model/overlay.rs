use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldMask, MutableDocument, Mutation};

/// The single mutation summarizing all pending local writes to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// A document with its overlay applied, plus the fields the overlay changed
/// (`None` when it replaced the whole document).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}
