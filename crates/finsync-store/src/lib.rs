//! # FinSync Store
//!
//! Local durable store for the FinSync worker: a keyed, versioned database
//! with named record collections, modelled on IndexedDB object stores.
//!
//! ## Features
//!
//! - **LocalDatabase**: idempotent `open()` that runs the schema upgrade
//! - **Collections**: key paths, auto-increment keys, secondary indexes
//! - **Backends**: in-memory (`MemoryBackend`) and SQLite (`SqliteBackend`)
//! - **Typed records**: API snapshots (`LocalRecord`) and the offline
//!   mutation queue (`QueuedOperation`)
//!
//! ## Architecture
//!
//! ```text
//! LocalDatabase (name, version)
//!     │
//!     └── open() ──► StoreHandle
//!                        │
//!                        └── dyn StoreBackend
//!                                ├── transactions  (LocalRecord, key: id)
//!                                ├── accounts      (reserved)
//!                                ├── categories    (reserved)
//!                                └── sync_queue    (QueuedOperation, auto id,
//!                                                   index: timestamp)
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use finsync_common::FinSyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub mod memory;
pub mod records;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use records::{schema, LocalRecord, QueuedOperation};
pub use sqlite::SqliteBackend;

// ==================== Errors ====================

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Version error: {0}")]
    VersionError(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::DataError(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::BackendError(e.to_string())
    }
}

impl From<StoreError> for FinSyncError {
    fn from(e: StoreError) -> Self {
        FinSyncError::storage_with_source("local store operation failed", e)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ==================== Keys ====================

/// A record key. Integers sort before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Convert a JSON value into a key. Only integers and strings are keys.
    pub fn from_json(value: &JsonValue) -> StoreResult<Self> {
        match value {
            JsonValue::String(s) => Ok(Key::Text(s.clone())),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Key::Int)
                .ok_or_else(|| StoreError::DataError(format!("Not an integer key: {}", n))),
            other => Err(StoreError::DataError(format!("Invalid key: {}", other))),
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Key::Int(n) => JsonValue::from(*n),
            Key::Text(s) => JsonValue::String(s.clone()),
        }
    }

    /// Integer value, if this is an integer key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(n) => Some(*n),
            Key::Text(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

// ==================== Schema ====================

/// Key path for collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    None,
    /// Top-level property of the stored object.
    Single(String),
}

impl KeyPath {
    /// Extract key value from a record.
    pub fn extract<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => value.get(path).filter(|v| !v.is_null()),
        }
    }

    /// Write a generated key into a record.
    pub fn inject(&self, value: &mut JsonValue, key: &Key) -> StoreResult<()> {
        match (self, value) {
            (KeyPath::None, _) => Ok(()),
            (KeyPath::Single(path), JsonValue::Object(map)) => {
                map.insert(path.clone(), key.to_json());
                Ok(())
            }
            (KeyPath::Single(path), other) => Err(StoreError::DataError(format!(
                "Cannot inject key at {:?} into non-object {}",
                path, other
            ))),
        }
    }

    /// The property name, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => Some(path),
        }
    }
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Top-level property indexed.
    pub key_path: String,
    pub unique: bool,
}

/// A collection definition, applied by the upgrade step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub key_path: KeyPath,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    /// Collection keyed by a property of each record.
    pub fn keyed(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: KeyPath::Single(key_path.to_string()),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// Collection whose key is generated and written into `key_path`.
    pub fn auto_increment(name: &str, key_path: &str) -> Self {
        Self {
            auto_increment: true,
            ..Self::keyed(name, key_path)
        }
    }

    /// Add a secondary index.
    pub fn with_index(mut self, name: &str, key_path: &str, unique: bool) -> Self {
        self.indexes.push(IndexSpec {
            name: name.to_string(),
            key_path: key_path.to_string(),
            unique,
        });
        self
    }
}

/// Resolve the key for a put: explicit key, then inline key, then a generated
/// one written back into the record. Advances `next_key` past any integer key
/// used on an auto-increment collection.
pub(crate) fn resolve_key(
    key_path: &KeyPath,
    auto_increment: bool,
    next_key: &mut i64,
    value: &mut JsonValue,
    key: Option<Key>,
) -> StoreResult<Key> {
    let key = match key {
        Some(k) => Some(k),
        None => key_path.extract(value).map(Key::from_json).transpose()?,
    };

    let key = match key {
        Some(k) => k,
        None if auto_increment => {
            let generated = Key::Int(*next_key);
            key_path.inject(value, &generated)?;
            generated
        }
        None => {
            return Err(StoreError::DataError(
                "No key provided and no auto-increment".to_string(),
            ))
        }
    };

    if auto_increment {
        if let Key::Int(n) = key {
            if n >= *next_key {
                *next_key = n + 1;
            }
        }
    }

    Ok(key)
}

// ==================== Backend ====================

/// Storage medium behind a `LocalDatabase`.
///
/// Implementations serialize their own access; callers may overlap freely.
/// Writes to the same key are last-write-wins.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Stored schema version (0 for a fresh database).
    async fn version(&self) -> StoreResult<u32>;

    /// Record a new schema version.
    async fn set_version(&self, version: u32) -> StoreResult<()>;

    /// Create the collection and any missing indexes. Existing data is kept.
    async fn ensure_collection(&self, spec: &CollectionSpec) -> StoreResult<()>;

    /// Names of existing collections.
    async fn collection_names(&self) -> StoreResult<Vec<String>>;

    /// Insert or overwrite a record, returning its key.
    async fn put(&self, collection: &str, value: JsonValue, key: Option<Key>) -> StoreResult<Key>;

    /// Get a record by key.
    async fn get(&self, collection: &str, key: &Key) -> StoreResult<Option<JsonValue>>;

    /// All records in key order.
    async fn get_all(&self, collection: &str) -> StoreResult<Vec<JsonValue>>;

    /// All records ordered by an index, ties broken by key.
    async fn get_all_by_index(&self, collection: &str, index: &str) -> StoreResult<Vec<JsonValue>>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, collection: &str, key: &Key) -> StoreResult<bool>;

    /// Number of records in a collection.
    async fn count(&self, collection: &str) -> StoreResult<usize>;
}

// ==================== Database ====================

/// A named, versioned local database.
#[derive(Clone)]
pub struct LocalDatabase {
    name: String,
    version: u32,
    collections: Arc<Vec<CollectionSpec>>,
    backend: Arc<dyn StoreBackend>,
}

impl fmt::Debug for LocalDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDatabase")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

impl LocalDatabase {
    /// Create a database over a backend with the worker schema.
    pub fn new(name: &str, version: u32, backend: Arc<dyn StoreBackend>) -> Self {
        Self::with_schema(name, version, schema(), backend)
    }

    /// Create a database with a custom schema.
    pub fn with_schema(
        name: &str,
        version: u32,
        collections: Vec<CollectionSpec>,
        backend: Arc<dyn StoreBackend>,
    ) -> Self {
        Self {
            name: name.to_string(),
            version,
            collections: Arc::new(collections),
            backend,
        }
    }

    /// In-memory database (lost when dropped).
    pub fn in_memory(name: &str, version: u32) -> Self {
        Self::new(name, version, Arc::new(MemoryBackend::new()))
    }

    /// SQLite-backed database at `path`.
    pub fn sqlite(path: impl AsRef<Path>, name: &str, version: u32) -> StoreResult<Self> {
        let backend = SqliteBackend::open(path)?;
        Ok(Self::new(name, version, Arc::new(backend)))
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested schema version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Open the database, running the upgrade step.
    ///
    /// The upgrade only creates what is missing, so this is safe to call
    /// before every access.
    pub async fn open(&self) -> StoreResult<StoreHandle> {
        let current = self.backend.version().await?;

        if self.version < current {
            return Err(StoreError::VersionError(format!(
                "Requested version {} of {} is less than current version {}",
                self.version, self.name, current
            )));
        }

        for spec in self.collections.iter() {
            self.backend.ensure_collection(spec).await?;
        }

        if self.version > current {
            self.backend.set_version(self.version).await?;
            info!(db = %self.name, old_version = current, new_version = self.version, "Database upgraded");
        } else {
            debug!(db = %self.name, version = current, "Database opened");
        }

        Ok(StoreHandle {
            backend: Arc::clone(&self.backend),
        })
    }
}

/// An open database. Cheap to clone; holds no locks.
#[derive(Clone)]
pub struct StoreHandle {
    backend: Arc<dyn StoreBackend>,
}

impl StoreHandle {
    /// Insert or overwrite a record.
    pub async fn put(&self, collection: &str, value: JsonValue, key: Option<Key>) -> StoreResult<Key> {
        self.backend.put(collection, value, key).await
    }

    /// Get a record.
    pub async fn get(&self, collection: &str, key: &Key) -> StoreResult<Option<JsonValue>> {
        self.backend.get(collection, key).await
    }

    /// All records in key order.
    pub async fn get_all(&self, collection: &str) -> StoreResult<Vec<JsonValue>> {
        self.backend.get_all(collection).await
    }

    /// All records ordered by an index.
    pub async fn get_all_by_index(&self, collection: &str, index: &str) -> StoreResult<Vec<JsonValue>> {
        self.backend.get_all_by_index(collection, index).await
    }

    /// Delete a record.
    pub async fn delete(&self, collection: &str, key: &Key) -> StoreResult<bool> {
        self.backend.delete(collection, key).await
    }

    /// Count records.
    pub async fn count(&self, collection: &str) -> StoreResult<usize> {
        self.backend.count(collection).await
    }

    /// Names of existing collections.
    pub async fn collection_names(&self) -> StoreResult<Vec<String>> {
        self.backend.collection_names().await
    }
}
