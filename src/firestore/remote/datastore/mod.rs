use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::watch_change::WatchChange;
use crate::firestore::value::BytesValue;

pub mod mock;

pub use mock::MockDatastore;

/// Request sent on the listen stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
    /// Starts listening to a target, resuming from its token or snapshot
    /// version when set.
    Listen(TargetData),
    Unlisten(i32),
}

/// Decoded listen stream message.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchResponse {
    pub change: WatchChange,
    /// Consistent snapshot the backend reached, or the minimum version when
    /// the message does not complete one.
    pub snapshot_version: SnapshotVersion,
}

impl WatchResponse {
    pub fn new(change: WatchChange) -> Self {
        Self {
            change,
            snapshot_version: SnapshotVersion::min(),
        }
    }

    pub fn with_snapshot_version(change: WatchChange, snapshot_version: SnapshotVersion) -> Self {
        Self {
            change,
            snapshot_version,
        }
    }
}

/// Request sent on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message of every write stream. Answered with a fresh stream
    /// token and no results.
    Handshake,
    Mutations {
        stream_token: BytesValue,
        mutations: Vec<Mutation>,
    },
}

/// Decoded write stream message.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: BytesValue,
    pub commit_version: SnapshotVersion,
    /// One result per mutation of the acknowledged batch.
    pub results: Vec<MutationResult>,
}

/// Result of a one-shot commit.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitResponse {
    pub commit_version: SnapshotVersion,
    pub results: Vec<MutationResult>,
}

/// Bidirectional stream with already-decoded messages.
///
/// `next` yields `None` once the stream is closed from either side.
#[async_trait]
pub trait StreamHandle<Request, Response>: Send + Sync {
    async fn send(&self, request: Request) -> FirestoreResult<()>;

    async fn next(&self) -> Option<FirestoreResult<Response>>;

    fn close(&self);
}

pub type WatchStreamHandle = Arc<dyn StreamHandle<WatchRequest, WatchResponse>>;
pub type WriteStreamHandle = Arc<dyn StreamHandle<WriteRequest, WriteResponse>>;

/// Network collaborator of the remote store. Transport, authentication and
/// wire encoding live behind this trait.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn open_watch_stream(&self) -> FirestoreResult<WatchStreamHandle>;

    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamHandle>;

    /// Atomically applies `mutations`. Used by transactions.
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<CommitResponse>;

    /// Reads `keys`; absent documents come back as no-documents at the read
    /// version.
    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>>;

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>>;

    /// Number of documents matching `query`.
    async fn run_aggregation_query(&self, query: &Query) -> FirestoreResult<i64>;
}
