//! SQLite backend.
//!
//! Records are stored as JSON text in a single `records` table, keyed by
//! `(collection, key_kind, key_int, key_text)` so that integer keys sort
//! before text keys, as they do in memory. Index order is computed with
//! `json_extract` at read time.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use finsync_common::now_millis;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{resolve_key, CollectionSpec, Key, KeyPath, StoreBackend, StoreError, StoreResult};

/// Backend table layout version.
const SCHEMA_VERSION: i32 = 1;

const KIND_INT: i64 = 0;
const KIND_TEXT: i64 = 1;

/// Durable backend over a single SQLite file.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create the database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::BackendError(format!("Failed to open {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "SQLite store opened");
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::BackendError(format!("Lock poisoned: {}", e)))
    }
}

fn init_tables(conn: &Connection) -> StoreResult<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_tables_v1(conn)?;
    }

    Ok(())
}

fn create_tables_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS db_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            key_path TEXT,
            auto_increment INTEGER NOT NULL DEFAULT 0,
            next_key INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS collection_indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            key_path TEXT NOT NULL,
            is_unique INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection, name)
        );

        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            key_kind INTEGER NOT NULL,
            key_int INTEGER NOT NULL DEFAULT 0,
            key_text TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            PRIMARY KEY (collection, key_kind, key_int, key_text)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, now_millis()],
    )?;

    info!(version = SCHEMA_VERSION, "SQLite store tables created");
    Ok(())
}

/// Primary key columns for a key.
fn key_columns(key: &Key) -> (i64, i64, &str) {
    match key {
        Key::Int(n) => (KIND_INT, *n, ""),
        Key::Text(s) => (KIND_TEXT, 0, s.as_str()),
    }
}

fn key_value(key: &Key) -> SqlValue {
    match key {
        Key::Int(n) => SqlValue::Integer(*n),
        Key::Text(s) => SqlValue::Text(s.clone()),
    }
}

/// JSON path selecting a top-level property.
fn json_path(property: &str) -> String {
    format!("$.\"{}\"", property.replace('"', "\\\""))
}

struct CollectionRow {
    key_path: KeyPath,
    auto_increment: bool,
    next_key: i64,
}

fn load_collection(conn: &Connection, name: &str) -> StoreResult<CollectionRow> {
    conn.query_row(
        "SELECT key_path, auto_increment, next_key FROM collections WHERE name = ?1",
        params![name],
        |row| {
            let key_path: Option<String> = row.get(0)?;
            Ok(CollectionRow {
                key_path: key_path.map(KeyPath::Single).unwrap_or(KeyPath::None),
                auto_increment: row.get(1)?,
                next_key: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFoundError(format!("Collection not found: {}", name)))
}

fn require_collection(conn: &Connection, name: &str) -> StoreResult<()> {
    load_collection(conn, name).map(|_| ())
}

/// Unique indexes as `(name, key_path)`.
fn unique_indexes(conn: &Connection, collection: &str) -> StoreResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT name, key_path FROM collection_indexes WHERE collection = ?1 AND is_unique = 1",
    )?;
    let rows = stmt
        .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn check_unique(
    tx: &Transaction<'_>,
    collection: &str,
    key: &Key,
    value: &JsonValue,
) -> StoreResult<()> {
    let (kind, key_int, key_text) = key_columns(key);

    for (name, property) in unique_indexes(tx, collection)? {
        let index_key = match value.get(&property).and_then(|v| Key::from_json(v).ok()) {
            Some(k) => k,
            None => continue,
        };

        let conflicts: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records
             WHERE collection = ?1
               AND json_extract(value, ?2) = ?3
               AND json_type(value, ?2) IN ('integer', 'text')
               AND NOT (key_kind = ?4 AND key_int = ?5 AND key_text = ?6)",
            params![
                collection,
                json_path(&property),
                key_value(&index_key),
                kind,
                key_int,
                key_text
            ],
            |row| row.get(0),
        )?;

        if conflicts > 0 {
            return Err(StoreError::ConstraintError(format!(
                "Duplicate key in unique index {}: {}",
                name, index_key
            )));
        }
    }
    Ok(())
}

fn collect_values(stmt: &mut rusqlite::Statement<'_>, params: impl rusqlite::Params) -> StoreResult<Vec<JsonValue>> {
    let texts = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    texts
        .iter()
        .map(|t| serde_json::from_str(t).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    async fn version(&self) -> StoreResult<u32> {
        let conn = self.lock()?;
        let version: Option<u32> = conn
            .query_row("SELECT version FROM db_meta WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    async fn set_version(&self, version: u32) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO db_meta (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            params![version],
        )?;
        Ok(())
    }

    async fn ensure_collection(&self, spec: &CollectionSpec) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let created = tx.execute(
            "INSERT OR IGNORE INTO collections (name, key_path, auto_increment) VALUES (?1, ?2, ?3)",
            params![spec.name, spec.key_path.as_str(), spec.auto_increment],
        )?;
        if created > 0 {
            debug!(collection = %spec.name, "Collection created");
        }

        for index in &spec.indexes {
            if index.unique {
                let path = json_path(&index.key_path);
                let duplicate: Option<String> = tx
                    .query_row(
                        "SELECT CAST(json_extract(value, ?2) AS TEXT) FROM records
                         WHERE collection = ?1 AND json_type(value, ?2) IN ('integer', 'text')
                         GROUP BY json_extract(value, ?2) HAVING COUNT(*) > 1 LIMIT 1",
                        params![spec.name, path],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(dup) = duplicate {
                    return Err(StoreError::ConstraintError(format!(
                        "Duplicate key in unique index {}: {}",
                        index.name, dup
                    )));
                }
            }

            tx.execute(
                "INSERT OR IGNORE INTO collection_indexes (collection, name, key_path, is_unique)
                 VALUES (?1, ?2, ?3, ?4)",
                params![spec.name, index.name, index.key_path, index.unique],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    async fn put(&self, collection: &str, mut value: JsonValue, key: Option<Key>) -> StoreResult<Key> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let row = load_collection(&tx, collection)?;
        let mut next_key = row.next_key;
        let key = resolve_key(&row.key_path, row.auto_increment, &mut next_key, &mut value, key)?;

        check_unique(&tx, collection, &key, &value)?;

        if next_key != row.next_key {
            tx.execute(
                "UPDATE collections SET next_key = ?2 WHERE name = ?1",
                params![collection, next_key],
            )?;
        }

        let (kind, key_int, key_text) = key_columns(&key);
        tx.execute(
            "INSERT OR REPLACE INTO records (collection, key_kind, key_int, key_text, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, kind, key_int, key_text, serde_json::to_string(&value)?],
        )?;

        tx.commit()?;
        Ok(key)
    }

    async fn get(&self, collection: &str, key: &Key) -> StoreResult<Option<JsonValue>> {
        let conn = self.lock()?;
        require_collection(&conn, collection)?;

        let (kind, key_int, key_text) = key_columns(key);
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM records
                 WHERE collection = ?1 AND key_kind = ?2 AND key_int = ?3 AND key_text = ?4",
                params![collection, kind, key_int, key_text],
                |row| row.get(0),
            )
            .optional()?;

        text.map(|t| serde_json::from_str(&t).map_err(StoreError::from))
            .transpose()
    }

    async fn get_all(&self, collection: &str) -> StoreResult<Vec<JsonValue>> {
        let conn = self.lock()?;
        require_collection(&conn, collection)?;

        let mut stmt = conn.prepare(
            "SELECT value FROM records WHERE collection = ?1
             ORDER BY key_kind, key_int, key_text",
        )?;
        collect_values(&mut stmt, params![collection])
    }

    async fn get_all_by_index(&self, collection: &str, index: &str) -> StoreResult<Vec<JsonValue>> {
        let conn = self.lock()?;
        require_collection(&conn, collection)?;

        let property: String = conn
            .query_row(
                "SELECT key_path FROM collection_indexes WHERE collection = ?1 AND name = ?2",
                params![collection, index],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFoundError(format!("Index not found: {}", index)))?;

        // Records whose indexed property is missing or not a valid key are
        // not part of the index.
        let mut stmt = conn.prepare(
            "SELECT value FROM records
             WHERE collection = ?1 AND json_type(value, ?2) IN ('integer', 'text')
             ORDER BY json_extract(value, ?2), key_kind, key_int, key_text",
        )?;
        collect_values(&mut stmt, params![collection, json_path(&property)])
    }

    async fn delete(&self, collection: &str, key: &Key) -> StoreResult<bool> {
        let conn = self.lock()?;
        require_collection(&conn, collection)?;

        let (kind, key_int, key_text) = key_columns(key);
        let removed = conn.execute(
            "DELETE FROM records
             WHERE collection = ?1 AND key_kind = ?2 AND key_int = ?3 AND key_text = ?4",
            params![collection, kind, key_int, key_text],
        )?;
        Ok(removed > 0)
    }

    async fn count(&self, collection: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        require_collection(&conn, collection)?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LocalRecord, QueuedOperation};
    use crate::LocalDatabase;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn queue_spec() -> CollectionSpec {
        CollectionSpec::auto_increment("sync_queue", "id").with_index("timestamp", "timestamp", false)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .ensure_collection(&CollectionSpec::keyed("transactions", "id"))
            .await
            .unwrap();

        let key = backend
            .put("transactions", json!({"id": "/api/accounts", "data": [1]}), None)
            .await
            .unwrap();
        assert_eq!(key, Key::from("/api/accounts"));

        let value = backend.get("transactions", &key).await.unwrap().unwrap();
        assert_eq!(value["data"], json!([1]));

        assert!(backend.delete("transactions", &key).await.unwrap());
        assert!(!backend.delete("transactions", &key).await.unwrap());
        assert!(backend.get("transactions", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let result = backend.get("nope", &Key::Int(1)).await;
        assert!(matches!(result, Err(StoreError::NotFoundError(_))));
    }

    #[tokio::test]
    async fn test_auto_increment_and_index_order() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&queue_spec()).await.unwrap();

        let a = backend
            .put("sync_queue", json!({"url": "/a", "timestamp": 30}), None)
            .await
            .unwrap();
        let b = backend
            .put("sync_queue", json!({"url": "/b", "timestamp": 10}), None)
            .await
            .unwrap();
        let c = backend
            .put("sync_queue", json!({"url": "/c", "timestamp": 20}), None)
            .await
            .unwrap();
        assert_eq!((a, b, c), (Key::Int(1), Key::Int(2), Key::Int(3)));

        let stored = backend.get("sync_queue", &Key::Int(2)).await.unwrap().unwrap();
        assert_eq!(stored["id"], 2);

        let urls: Vec<_> = backend
            .get_all_by_index("sync_queue", "timestamp")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v["url"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(urls, vec!["/b", "/c", "/a"]);
    }

    #[tokio::test]
    async fn test_deleted_keys_not_reused() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&queue_spec()).await.unwrap();

        let first = backend.put("sync_queue", json!({"timestamp": 1}), None).await.unwrap();
        backend.delete("sync_queue", &first).await.unwrap();
        let second = backend.put("sync_queue", json!({"timestamp": 2}), None).await.unwrap();
        assert_eq!(second, Key::Int(2));
    }

    #[tokio::test]
    async fn test_key_order_ints_before_text() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .ensure_collection(&CollectionSpec {
                name: "mixed".to_string(),
                key_path: KeyPath::None,
                auto_increment: false,
                indexes: Vec::new(),
            })
            .await
            .unwrap();

        backend.put("mixed", json!("t"), Some(Key::from("a"))).await.unwrap();
        backend.put("mixed", json!("i10"), Some(Key::Int(10))).await.unwrap();
        backend.put("mixed", json!("i2"), Some(Key::Int(2))).await.unwrap();

        let all = backend.get_all("mixed").await.unwrap();
        assert_eq!(all, vec![json!("i2"), json!("i10"), json!("t")]);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .ensure_collection(&CollectionSpec::keyed("accounts", "id").with_index("name", "name", true))
            .await
            .unwrap();

        backend
            .put("accounts", json!({"id": "a1", "name": "Checking"}), None)
            .await
            .unwrap();
        // Overwriting the same record is fine.
        backend
            .put("accounts", json!({"id": "a1", "name": "Checking"}), None)
            .await
            .unwrap();

        let result = backend
            .put("accounts", json!({"id": "a2", "name": "Checking"}), None)
            .await;
        assert!(matches!(result, Err(StoreError::ConstraintError(_))));
        assert_eq!(backend.count("accounts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("finance-offline.db");

        {
            let store = LocalDatabase::sqlite(&path, "finance-offline", 1)
                .unwrap()
                .open()
                .await
                .unwrap();
            store
                .save_snapshot(&LocalRecord::capture("/api/accounts", json!([{"id": "a1"}])))
                .await
                .unwrap();
            store
                .enqueue(&QueuedOperation::new(
                    "POST",
                    "https://app.example/api/transactions",
                    BTreeMap::new(),
                    Some("{}".to_string()),
                ))
                .await
                .unwrap();
        }

        let db = LocalDatabase::sqlite(&path, "finance-offline", 1).unwrap();
        let store = db.open().await.unwrap();
        assert_eq!(store.snapshots().await.unwrap().len(), 1);

        let queued = store.queued_operations().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, Some(1));

        // The generator continues after reopen.
        let next = store
            .enqueue(&QueuedOperation::new("DELETE", "https://app.example/api/goals/1", BTreeMap::new(), None))
            .await
            .unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn test_downgrade_rejected_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");

        LocalDatabase::sqlite(&path, "db", 3).unwrap().open().await.unwrap();
        let result = LocalDatabase::sqlite(&path, "db", 2).unwrap().open().await;
        assert!(matches!(result, Err(StoreError::VersionError(_))));
    }
}
