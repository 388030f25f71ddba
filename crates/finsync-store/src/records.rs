//! Typed records the worker persists.

use std::collections::BTreeMap;

use finsync_common::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::{CollectionSpec, Key, StoreError, StoreHandle, StoreResult};

/// Last-known-good API payloads, keyed by endpoint path.
pub const TRANSACTIONS: &str = "transactions";
/// Reserved.
pub const ACCOUNTS: &str = "accounts";
/// Reserved.
pub const CATEGORIES: &str = "categories";
/// Offline mutation queue.
pub const SYNC_QUEUE: &str = "sync_queue";
/// Enqueue-time index on `sync_queue`.
pub const TIMESTAMP_INDEX: &str = "timestamp";

/// The four collections created on open.
pub fn schema() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::keyed(TRANSACTIONS, "id"),
        CollectionSpec::keyed(ACCOUNTS, "id"),
        CollectionSpec::keyed(CATEGORIES, "id"),
        CollectionSpec::auto_increment(SYNC_QUEUE, "id").with_index(TIMESTAMP_INDEX, "timestamp", false),
    ]
}

/// Snapshot of one API endpoint's last successful JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Endpoint path, e.g. `/api/accounts`.
    pub id: String,
    pub data: JsonValue,
    /// Capture time (ms since epoch).
    pub timestamp: i64,
}

impl LocalRecord {
    /// Snapshot captured now.
    pub fn capture(path: &str, data: JsonValue) -> Self {
        Self {
            id: path.to_string(),
            data,
            timestamp: now_millis(),
        }
    }
}

/// A mutating request deferred for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Assigned by the store on enqueue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Enqueue time (ms since epoch).
    pub timestamp: i64,
}

impl QueuedOperation {
    /// Operation stamped with the current time. Bodies of GET requests are
    /// never captured.
    pub fn new(
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Self {
        let body = if method.eq_ignore_ascii_case("GET") {
            None
        } else {
            body
        };
        Self {
            id: None,
            url: url.to_string(),
            method: method.to_ascii_uppercase(),
            headers,
            body,
            timestamp: now_millis(),
        }
    }
}

impl StoreHandle {
    /// Upsert an endpoint snapshot.
    pub async fn save_snapshot(&self, record: &LocalRecord) -> StoreResult<()> {
        let value = serde_json::to_value(record)?;
        self.put(TRANSACTIONS, value, None).await?;
        trace!(path = %record.id, "Snapshot saved");
        Ok(())
    }

    /// Snapshot for an endpoint path.
    pub async fn snapshot(&self, path: &str) -> StoreResult<Option<LocalRecord>> {
        match self.get(TRANSACTIONS, &Key::from(path)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All snapshots in path order.
    pub async fn snapshots(&self) -> StoreResult<Vec<LocalRecord>> {
        self.get_all(TRANSACTIONS)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    /// Persist an operation, returning its assigned id.
    pub async fn enqueue(&self, operation: &QueuedOperation) -> StoreResult<i64> {
        let mut value = serde_json::to_value(operation)?;
        // A caller-supplied id would overwrite another queued operation.
        if let JsonValue::Object(ref mut map) = value {
            map.remove("id");
        }

        let key = self.put(SYNC_QUEUE, value, None).await?;
        let id = key
            .as_int()
            .ok_or_else(|| StoreError::DataError(format!("Queue key is not numeric: {}", key)))?;

        debug!(id, method = %operation.method, url = %operation.url, "Operation queued");
        Ok(id)
    }

    /// Queued operations, oldest first.
    pub async fn queued_operations(&self) -> StoreResult<Vec<QueuedOperation>> {
        self.get_all_by_index(SYNC_QUEUE, TIMESTAMP_INDEX)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    /// Remove a replayed operation.
    pub async fn dequeue(&self, id: i64) -> StoreResult<bool> {
        self.delete(SYNC_QUEUE, &Key::Int(id)).await
    }

    /// Number of queued operations.
    pub async fn queue_len(&self) -> StoreResult<usize> {
        self.count(SYNC_QUEUE).await
    }
}
