use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKeySet, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the sync engine.
///
/// Every call arrives as a job on the client's async queue.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot reported by the listen stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to serve `target_id`; listeners are failed with
    /// `error`.
    async fn reject_listen(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// A batch failed permanently; its local effects are rolled back.
    async fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    /// Documents the sync engine believes are in `target_id` on the backend,
    /// including limbo documents for limbo resolution targets.
    fn get_remote_keys_for_target(&self, target_id: i32) -> DocumentKeySet;
}
