//! # FinSync Cache
//!
//! Named, versioned response caches for the FinSync worker, modelled on the
//! Cache Storage API.
//!
//! ## Features
//!
//! - **CacheStorage**: `open()`, `has()`, `keys()`, `delete()`, cross-bucket
//!   `match_any()` and allow-list eviction via `retain_only()`
//! - **Bucket**: `put()`, `match_request()`, `delete()`, `keys()`
//! - **Snapshots**: entries keep status, headers and body bytes, and are
//!   replayed unchanged
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (shared, Arc<RwLock>)
//!     ├── finance-static-v1   (app shell)
//!     ├── finance-dynamic-v1  (documents, misc resources)
//!     └── finance-api-v1      (successful API GETs)
//!             └── absolute URL → CacheEntry
//! ```

use std::sync::Arc;

use bytes::Bytes;
use finsync_common::{now_millis, FinSyncError};
use finsync_net::{Request, Response, ResponseSource};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Request not cacheable: {0}")]
    NotCacheable(String),

    #[error("Response not cacheable: {0}")]
    InvalidResponse(String),

    #[error("Cache not found: {0}")]
    NotFound(String),
}

impl From<CacheError> for FinSyncError {
    fn from(e: CacheError) -> Self {
        FinSyncError::cache(e.to_string())
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers in wire order. Repeated names stay separate
    /// entries; values are raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response for a request.
    pub fn capture(request: &Request, response: &Response) -> Self {
        Self {
            url: cache_key(&request.url),
            method: request.method.as_str().to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Replay the stored response.
    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.header_map(),
            body: Bytes::from(self.body.clone()),
            source: ResponseSource::Cache,
        }
    }

    fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => trace!(url = %self.url, header = %name, "Skipping unreadable stored header"),
            }
        }
        headers
    }
}

/// Entries are keyed by absolute URL without the fragment.
fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

// ==================== Cache ====================

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct StorageState {
    caches: HashMap<String, Cache>,
    /// Creation order, searched by `match_any`.
    order: Vec<String>,
}

impl StorageState {
    fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
            debug!(cache = name, "Cache created");
        }
        self.caches.entry(name.to_string()).or_default()
    }

    fn remove(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }
}

// ==================== Cache Storage ====================

/// All caches of one worker. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    state: Arc<RwLock<StorageState>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Bucket {
        self.state.write().await.open(name);
        Bucket {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.state.read().await.caches.contains_key(name)
    }

    /// Cache names in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.state.write().await.remove(name);
        if removed {
            debug!(cache = name, "Cache deleted");
        }
        removed
    }

    /// Match across all caches, oldest cache first.
    pub async fn match_any(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        let key = cache_key(&request.url);
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.caches.get(name))
            .find_map(|cache| cache.entries.get(&key))
            .map(CacheEntry::to_response)
    }

    /// Delete every cache whose name is not in `allow_list`. Returns the
    /// deleted names.
    pub async fn retain_only(&self, allow_list: &[&str]) -> Vec<String> {
        let mut state = self.state.write().await;
        let stale: Vec<String> = state
            .order
            .iter()
            .filter(|name| !allow_list.contains(&name.as_str()))
            .cloned()
            .collect();

        for name in &stale {
            state.remove(name);
            info!(cache = %name, "Deleted stale cache");
        }
        stale
    }
}

// ==================== Bucket ====================

/// Handle to one named cache.
///
/// A handle whose cache was deleted re-creates it on the next `put`.
#[derive(Debug, Clone)]
pub struct Bucket {
    name: String,
    state: Arc<RwLock<StorageState>>,
}

impl Bucket {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a response for a GET request, replacing any previous entry.
    pub async fn put(&self, request: &Request, response: &Response) -> CacheResult<()> {
        if request.method != Method::GET {
            return Err(CacheError::NotCacheable(format!(
                "{} {}",
                request.method, request.url
            )));
        }
        if response.is_network_error() || response.status == 206 {
            return Err(CacheError::InvalidResponse(format!(
                "status {} for {}",
                response.status, request.url
            )));
        }

        let entry = CacheEntry::capture(request, response);
        trace!(cache = %self.name, url = %entry.url, status = entry.status, "Cache put");

        let mut state = self.state.write().await;
        state.open(&self.name).entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Match a request. Non-GET requests never match.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.entry(&request.url).await.map(|e| e.to_response())
    }

    /// Stored entry for a URL.
    pub async fn entry(&self, url: &Url) -> Option<CacheEntry> {
        let state = self.state.read().await;
        state
            .caches
            .get(&self.name)
            .and_then(|cache| cache.entries.get(&cache_key(url)))
            .cloned()
    }

    /// Delete entry.
    pub async fn delete(&self, request: &Request) -> bool {
        let key = cache_key(&request.url);
        let mut state = self.state.write().await;
        state
            .caches
            .get_mut(&self.name)
            .map(|cache| cache.entries.remove(&key).is_some())
            .unwrap_or(false)
    }

    /// Stored URLs, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .caches
            .get(&self.name)
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        state
            .caches
            .get(&self.name)
            .map(|cache| cache.entries.len())
            .unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
