//! In-memory backend.
//!
//! Object stores live in a `tokio::sync::RwLock`; every operation takes the
//! lock once, so overlapping callers see each put/delete atomically.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{
    resolve_key, CollectionSpec, IndexSpec, Key, KeyPath, StoreBackend, StoreError, StoreResult,
};

// ==================== Index ====================

/// A secondary index on an object store.
#[derive(Debug, Clone)]
struct Index {
    spec: IndexSpec,
    /// Index key -> primary keys.
    entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl Index {
    fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    /// Index key for a record; records without an indexable value are skipped.
    fn index_key(&self, value: &JsonValue) -> Option<Key> {
        value
            .get(&self.spec.key_path)
            .and_then(|v| Key::from_json(v).ok())
    }

    fn check_unique(&self, index_key: &Key, primary_key: &Key) -> StoreResult<()> {
        if !self.spec.unique {
            return Ok(());
        }
        match self.entries.get(index_key) {
            Some(keys) if keys.iter().any(|k| k != primary_key) => Err(StoreError::ConstraintError(
                format!("Duplicate key in unique index {}: {}", self.spec.name, index_key),
            )),
            _ => Ok(()),
        }
    }

    fn add_entry(&mut self, index_key: Key, primary_key: Key) {
        self.entries.entry(index_key).or_default().insert(primary_key);
    }

    fn delete_entry(&mut self, index_key: &Key, primary_key: &Key) {
        if let Some(keys) = self.entries.get_mut(index_key) {
            keys.remove(primary_key);
            if keys.is_empty() {
                self.entries.remove(index_key);
            }
        }
    }
}

// ==================== ObjectStore ====================

#[derive(Debug)]
struct ObjectStore {
    key_path: KeyPath,
    auto_increment: bool,
    records: BTreeMap<Key, JsonValue>,
    indexes: HashMap<String, Index>,
    /// Next auto-increment key.
    next_key: i64,
}

impl ObjectStore {
    fn new(spec: &CollectionSpec) -> Self {
        Self {
            key_path: spec.key_path.clone(),
            auto_increment: spec.auto_increment,
            records: BTreeMap::new(),
            indexes: HashMap::new(),
            next_key: 1,
        }
    }

    fn create_index(&mut self, spec: &IndexSpec) -> StoreResult<()> {
        let mut index = Index::new(spec.clone());

        // Build index from existing records
        for (primary_key, value) in &self.records {
            if let Some(index_key) = index.index_key(value) {
                index.check_unique(&index_key, primary_key)?;
                index.add_entry(index_key, primary_key.clone());
            }
        }

        self.indexes.insert(spec.name.clone(), index);
        Ok(())
    }

    fn put(&mut self, mut value: JsonValue, key: Option<Key>) -> StoreResult<Key> {
        let key = resolve_key(
            &self.key_path,
            self.auto_increment,
            &mut self.next_key,
            &mut value,
            key,
        )?;

        // Validate unique indexes before touching anything
        for index in self.indexes.values() {
            if let Some(index_key) = index.index_key(&value) {
                index.check_unique(&index_key, &key)?;
            }
        }

        self.remove_from_indexes(&key);
        for index in self.indexes.values_mut() {
            if let Some(index_key) = index.index_key(&value) {
                index.add_entry(index_key, key.clone());
            }
        }

        self.records.insert(key.clone(), value);
        Ok(key)
    }

    fn delete(&mut self, key: &Key) -> bool {
        self.remove_from_indexes(key);
        self.records.remove(key).is_some()
    }

    fn remove_from_indexes(&mut self, primary_key: &Key) {
        if let Some(value) = self.records.get(primary_key) {
            for index in self.indexes.values_mut() {
                if let Some(index_key) = index.index_key(value) {
                    index.delete_entry(&index_key, primary_key);
                }
            }
        }
    }

    fn by_index(&self, name: &str) -> StoreResult<Vec<JsonValue>> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| StoreError::NotFoundError(format!("Index not found: {}", name)))?;

        Ok(index
            .entries
            .values()
            .flatten()
            .filter_map(|k| self.records.get(k).cloned())
            .collect())
    }
}

// ==================== Backend ====================

#[derive(Debug, Default)]
struct MemoryState {
    version: u32,
    stores: HashMap<String, ObjectStore>,
}

impl MemoryState {
    fn store(&self, name: &str) -> StoreResult<&ObjectStore> {
        self.stores
            .get(name)
            .ok_or_else(|| StoreError::NotFoundError(format!("Collection not found: {}", name)))
    }

    fn store_mut(&mut self, name: &str) -> StoreResult<&mut ObjectStore> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFoundError(format!("Collection not found: {}", name)))
    }
}

/// Volatile backend for tests and ephemeral workers.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn version(&self) -> StoreResult<u32> {
        Ok(self.state.read().await.version)
    }

    async fn set_version(&self, version: u32) -> StoreResult<()> {
        self.state.write().await.version = version;
        Ok(())
    }

    async fn ensure_collection(&self, spec: &CollectionSpec) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let store = state
            .stores
            .entry(spec.name.clone())
            .or_insert_with(|| ObjectStore::new(spec));

        for index in &spec.indexes {
            if !store.indexes.contains_key(&index.name) {
                store.create_index(index)?;
            }
        }
        Ok(())
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.read().await.stores.keys().cloned().collect())
    }

    async fn put(&self, collection: &str, value: JsonValue, key: Option<Key>) -> StoreResult<Key> {
        self.state.write().await.store_mut(collection)?.put(value, key)
    }

    async fn get(&self, collection: &str, key: &Key) -> StoreResult<Option<JsonValue>> {
        Ok(self.state.read().await.store(collection)?.records.get(key).cloned())
    }

    async fn get_all(&self, collection: &str) -> StoreResult<Vec<JsonValue>> {
        Ok(self
            .state
            .read()
            .await
            .store(collection)?
            .records
            .values()
            .cloned()
            .collect())
    }

    async fn get_all_by_index(&self, collection: &str, index: &str) -> StoreResult<Vec<JsonValue>> {
        self.state.read().await.store(collection)?.by_index(index)
    }

    async fn delete(&self, collection: &str, key: &Key) -> StoreResult<bool> {
        Ok(self.state.write().await.store_mut(collection)?.delete(key))
    }

    async fn count(&self, collection: &str) -> StoreResult<usize> {
        Ok(self.state.read().await.store(collection)?.records.len())
    }
}
