use serde::{Deserialize, Serialize};

use crate::firestore::constants::DEFAULT_DATABASE_ID;
use crate::firestore::model::DocumentKey;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Fully qualified resource name of `key`, as used by the backend and by
    /// existence-filter Bloom filters.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}",
            self.project_id,
            self.database,
            key.path().canonical_string()
        )
    }

    /// Name of the directory used for durable persistence of this database.
    pub fn persistence_key(&self) -> String {
        format!("{}.{}", self.project_id, self.database)
    }
}
