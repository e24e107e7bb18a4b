//! Local persistence and the caches built on it.

pub mod document_overlay_cache;
pub mod index_backfiller;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod schema;
pub mod shared_client_state;
pub mod simple_db;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruResults, LruScheduler};
#[doc(inline)]
pub use index_backfiller::{IndexBackfiller, IndexBackfillerScheduler};
#[doc(inline)]
pub use persistence::{Persistence, PersistenceTransaction, TransactionMode};
#[doc(inline)]
pub use shared_client_state::{MemorySharedClientState, QueryTargetState, SharedClientState};
#[doc(inline)]
pub use simple_db::{FileBackend, KvBackend, MemoryBackend};
#[doc(inline)]
pub use target_data::{QueryPurpose, TargetData};
