use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::firestore::error::{data_loss, internal_error, FirestoreResult};

/// One component of a compound store key. Integers sort before strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Str(String),
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Str(value.clone())
    }
}

impl KeyPart {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyPart::Int(value) => Some(*value),
            KeyPart::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPart::Str(value) => Some(value),
            KeyPart::Int(_) => None,
        }
    }
}

/// Builds a [`DbKey`] from heterogeneous parts.
#[macro_export]
#[doc(hidden)]
macro_rules! db_key {
    ($($part:expr),* $(,)?) => {
        vec![$($crate::firestore::local::simple_db::KeyPart::from($part)),*]
    };
}

pub type DbKey = Vec<KeyPart>;
pub type Store = BTreeMap<DbKey, Value>;
/// Every logical store by name.
pub type StoreData = BTreeMap<String, Store>;

/// Failure to make a commit durable. Retried by the persistence layer.
#[derive(Debug)]
pub struct CommitFault(pub String);

/// Storage medium behind [`Persistence`](crate::firestore::local::Persistence).
///
/// Backends see whole-database snapshots: `load` returns the last committed
/// state and `commit` must make `data` durable atomically.
pub trait KvBackend: Send + Sync + Debug {
    fn is_durable(&self) -> bool;

    fn load(&self) -> FirestoreResult<Option<StoreData>>;

    fn commit(&self, data: &StoreData) -> Result<(), CommitFault>;

    /// True if another process committed since this backend last loaded or
    /// committed.
    fn has_external_changes(&self) -> bool {
        false
    }

    /// Deletes everything the backend has stored.
    fn destroy(&self) -> FirestoreResult<()>;
}

/// Transient backend. Commits are no-ops since the in-memory state is the
/// only copy.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    pub fn new() -> Self {
        Self
    }
}

impl KvBackend for MemoryBackend {
    fn is_durable(&self) -> bool {
        false
    }

    fn load(&self) -> FirestoreResult<Option<StoreData>> {
        Ok(None)
    }

    fn commit(&self, _data: &StoreData) -> Result<(), CommitFault> {
        Ok(())
    }

    fn destroy(&self) -> FirestoreResult<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    stores: BTreeMap<String, Vec<(DbKey, Value)>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Durable backend storing the database as one JSON document. Commits write
/// the whole snapshot to a temporary file and rename it over the previous
/// one. The file is not locked; only one process may open it at a time.
pub struct FileBackend {
    path: PathBuf,
    last_stamp: StdMutex<Option<FileStamp>>,
}

impl Debug for FileBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackend").field("path", &self.path).finish()
    }
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                internal_error(format!(
                    "Failed to create persistence directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path,
            last_stamp: StdMutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current_stamp(&self) -> Option<FileStamp> {
        fs::metadata(&self.path).ok().map(|metadata| FileStamp {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp-{}", std::process::id()));
        self.path.with_file_name(name)
    }

    fn write_snapshot(&self, data: &StoreData) -> std::io::Result<()> {
        let snapshot = Snapshot {
            stores: data
                .iter()
                .map(|(name, store)| {
                    (
                        name.clone(),
                        store
                            .iter()
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect(),
                    )
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)
    }
}

impl KvBackend for FileBackend {
    fn is_durable(&self) -> bool {
        true
    }

    fn load(&self) -> FirestoreResult<Option<StoreData>> {
        let stamp = self.current_stamp();
        if stamp.is_none() {
            *self.last_stamp.lock().unwrap() = None;
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|err| {
            internal_error(format!(
                "Failed to read persistence file '{}': {err}",
                self.path.display()
            ))
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|err| {
            data_loss(format!(
                "Persistence file '{}' is corrupted: {err}",
                self.path.display()
            ))
        })?;
        *self.last_stamp.lock().unwrap() = stamp;
        Ok(Some(
            snapshot
                .stores
                .into_iter()
                .map(|(name, entries)| (name, entries.into_iter().collect()))
                .collect(),
        ))
    }

    fn commit(&self, data: &StoreData) -> Result<(), CommitFault> {
        self.write_snapshot(data).map_err(|err| {
            CommitFault(format!(
                "Failed to write persistence file '{}': {err}",
                self.path.display()
            ))
        })?;
        *self.last_stamp.lock().unwrap() = self.current_stamp();
        Ok(())
    }

    fn has_external_changes(&self) -> bool {
        let last = *self.last_stamp.lock().unwrap();
        last != self.current_stamp()
    }

    fn destroy(&self) -> FirestoreResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|err| {
                internal_error(format!(
                    "Failed to remove persistence file '{}': {err}",
                    self.path.display()
                ))
            })?;
        }
        *self.last_stamp.lock().unwrap() = None;
        Ok(())
    }
}

/// Whether `key` starts with every part of `prefix`.
pub fn has_prefix(key: &DbKey, prefix: &[KeyPart]) -> bool {
    key.len() >= prefix.len() && key[..prefix.len()] == *prefix
}
