use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::firestore::core::settings::{FirestoreSettings, PersistenceSettings};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::Persistence;
use crate::firestore::model::DatabaseId;
use crate::firestore::util::async_queue::AsyncQueue;

const CLIENT_ID_LENGTH: usize = 20;

/// Everything the components of one client share: which database it talks
/// to, who it is, where it stores data and the queue it runs on.
#[derive(Clone, Debug)]
pub struct DatabaseContext {
    database_id: DatabaseId,
    client_id: String,
    persistence: Arc<Persistence>,
    queue: AsyncQueue,
    settings: FirestoreSettings,
}

impl DatabaseContext {
    /// Validates `settings` and opens the persistence they describe under a
    /// fresh client id.
    pub fn new(database_id: DatabaseId, settings: FirestoreSettings) -> FirestoreResult<Self> {
        settings.validate()?;
        let client_id = generate_client_id();
        let persistence = match &settings.persistence {
            PersistenceSettings::Memory => Persistence::memory(client_id.clone())?,
            PersistenceSettings::Durable { path } => Persistence::file(path, client_id.clone())?,
        };
        log::debug!(
            "opened {} persistence for {} as client {client_id}",
            if persistence.is_durable() { "durable" } else { "memory" },
            database_id.persistence_key()
        );
        Ok(Self {
            database_id,
            client_id,
            persistence,
            queue: AsyncQueue::new(),
            settings,
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[tokio::test]
    async fn opens_memory_persistence_by_default() {
        let context = DatabaseContext::new(DatabaseId::default("p"), FirestoreSettings::default()).unwrap();
        assert_eq!(context.client_id().len(), CLIENT_ID_LENGTH);
        assert!(!context.persistence().is_durable());
        assert_eq!(context.persistence().client_id(), context.client_id());
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let settings = FirestoreSettings {
            max_concurrent_limbo_resolutions: 0,
            ..FirestoreSettings::default()
        };
        let err = DatabaseContext::new(DatabaseId::default("p"), settings).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }
}
