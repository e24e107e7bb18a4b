//! Query model, views and the sync engine that keeps them current, plus the
//! client facade on top.

pub mod database_context;
pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod settings;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod transaction_runner;
pub mod user;
pub mod view;
pub mod view_snapshot;

pub use database_context::DatabaseContext;
pub use document_set::DocumentSet;
pub use event_manager::{EventManager, ListenOptions, ListenSource, QueryListener, SnapshotObserver};
pub use firestore_client::{FirestoreClient, ListenerRegistration, Source};
pub use query::{LimitType, Query};
pub use sync_engine::{OnlineStateSource, SyncEngine, SyncEngineListener};
pub use target::{Bound, Direction, FieldFilter, FilterOperator, OrderBy, Target};
pub use transaction::Transaction;
pub use transaction_runner::{TransactionOptions, TransactionRunner};
pub use user::User;
pub use view_snapshot::{ChangeType, DocumentViewChange, SyncState, ViewSnapshot};
