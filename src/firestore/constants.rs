pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Target id reserved for the per-document LRU sentinel rows.
pub const LRU_SENTINEL_TARGET_ID: i32 = 0;

/// Batch id meaning "no batch", used by overlays and index offsets.
pub const BATCH_ID_UNKNOWN: i32 = -1;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

pub const DEFAULT_TRANSACTION_MAX_ATTEMPTS: u32 = 5;

/// Writes the remote store keeps in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;

pub const CACHE_SIZE_UNLIMITED: i64 = -1;

pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
