use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path of a single document. Always has an even, non-zero segment count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid document key '{path}': document keys must have an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    /// Builds `collection/id` without validation of `collection`'s parity
    /// beyond what [`from_path`](Self::from_path) checks.
    pub fn from_collection_and_id(collection: &ResourcePath, id: &str) -> FirestoreResult<Self> {
        Self::from_path(collection.child([id]))
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection directly containing this document.
    pub fn collection_group(&self) -> &str {
        self.path.segment(self.path.len() - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.canonical_string())
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DocumentKey::from_string(&raw).map_err(serde::de::Error::custom)
    }
}
