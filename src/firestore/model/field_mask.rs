use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths a patch mutation touches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.fields.contains(path)
    }

    /// Whether some path in the mask is a prefix of (or equal to) `path`.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }
}
