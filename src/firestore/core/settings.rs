//! Client configuration.
//!
//! Settings can be built in code or deserialized from JSON; every
//! constructor validates its values.

use std::path::PathBuf;

use serde::Deserialize;

use crate::firestore::constants::{
    CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
    DEFAULT_TRANSACTION_MAX_ATTEMPTS, MINIMUM_CACHE_SIZE_BYTES,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};

pub const DEFAULT_LRU_PERCENTILE: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;
pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 8.0;

/// Where the local cache lives.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceSettings {
    Memory,
    Durable { path: PathBuf },
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        PersistenceSettings::Memory
    }
}

/// Parameters of the LRU garbage collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection runs only while the cache is larger than this many bytes.
    /// [`CACHE_SIZE_UNLIMITED`] disables collection.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            percentile_to_collect: DEFAULT_LRU_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != CACHE_SIZE_UNLIMITED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE_BYTES)
    }
}

/// Controls automatic creation of client-side indexes by the query engine.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Minimum number of documents a scan must read before an index is
    /// considered.
    pub min_collection_size: usize,
    /// An index is created when a scan reads more than this many documents
    /// per result.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct FirestoreSettings {
    pub persistence: PersistenceSettings,
    /// Target cache size in bytes, or [`CACHE_SIZE_UNLIMITED`].
    pub cache_size_bytes: i64,
    pub index_auto_creation: IndexAutoCreationSettings,
    pub max_concurrent_limbo_resolutions: usize,
    pub transaction_max_attempts: u32,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceSettings::Memory,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            index_auto_creation: IndexAutoCreationSettings::default(),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            transaction_max_attempts: DEFAULT_TRANSACTION_MAX_ATTEMPTS,
        }
    }
}

impl FirestoreSettings {
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            persistence: PersistenceSettings::Durable { path: path.into() },
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> FirestoreResult<Self> {
        let settings: FirestoreSettings = serde_json::from_str(json)
            .map_err(|err| invalid_argument(format!("Invalid settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if self.transaction_max_attempts == 0 {
            return Err(invalid_argument("transaction_max_attempts must be greater than zero"));
        }
        if !(self.index_auto_creation.relative_index_read_cost_per_document > 0.0) {
            return Err(invalid_argument(
                "relative_index_read_cost_per_document must be positive",
            ));
        }
        Ok(())
    }

    pub fn lru_params(&self) -> LruParams {
        LruParams::with_cache_size(self.cache_size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn json_fills_in_defaults() {
        let settings = FirestoreSettings::from_json(
            r#"{"persistence": {"kind": "durable", "path": "/tmp/cache.json"},
                "index_auto_creation": {"enabled": true}}"#,
        )
        .unwrap();
        assert_eq!(
            settings.persistence,
            PersistenceSettings::Durable {
                path: PathBuf::from("/tmp/cache.json")
            }
        );
        assert!(settings.index_auto_creation.enabled);
        assert_eq!(settings.index_auto_creation.min_collection_size, 100);
        assert_eq!(settings.cache_size_bytes, DEFAULT_CACHE_SIZE_BYTES);
    }

    #[test]
    fn rejects_tiny_cache() {
        let err = FirestoreSettings::from_json(r#"{"cache_size_bytes": 10}"#).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(FirestoreSettings::from_json(r#"{"cache_size_bytes": -1}"#).is_ok());
    }

    #[test]
    fn unlimited_cache_disables_lru() {
        let settings = FirestoreSettings {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..FirestoreSettings::default()
        };
        assert!(!settings.lru_params().is_enabled());
        assert!(LruParams::default().is_enabled());
    }
}
