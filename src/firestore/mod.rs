pub mod constants;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;
pub mod value;

pub use self::core::firestore_client::{FirestoreClient, ListenerRegistration, Source};
pub use self::core::settings::{FirestoreSettings, PersistenceSettings};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
