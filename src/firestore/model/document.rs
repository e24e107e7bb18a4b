use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Not present in the cache at all.
    Invalid,
    FoundDocument,
    NoDocument,
    /// Known to exist at `version` but with unknown contents, the result of
    /// a patch acknowledged without a server-side base document.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as tracked by the caches. The same value type represents found,
/// missing, unknown and not-yet-cached documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + 24 + self.data.estimate_byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/1").unwrap()
    }

    #[test]
    fn create_time_is_set_on_first_found_conversion() {
        let v1 = SnapshotVersion::new(Timestamp::new(1, 0));
        let v2 = SnapshotVersion::new(Timestamp::new(2, 0));
        let mut doc = MutableDocument::new_found_document(key(), v1, MapValue::empty());
        assert_eq!(doc.create_time(), v1);
        doc.convert_to_found_document(v2, MapValue::empty());
        assert_eq!(doc.create_time(), v1);
        assert_eq!(doc.version(), v2);
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(5, 0)),
            MapValue::empty(),
        );
        doc.set_has_local_mutations();
        assert!(doc.has_pending_writes());
        assert!(doc.version().is_min());
        assert!(doc.is_valid_document());
        assert!(!MutableDocument::new_invalid_document(key()).is_valid_document());
    }
}
