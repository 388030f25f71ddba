//! Offline mutation queue: enqueue, background sync registration and replay.
//!
//! Queued operations are retried on every sync trigger until the server
//! accepts them. There is no attempt cap and no idempotency key, so a
//! request that reached the server before the connection dropped can be
//! applied twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use finsync_net::{classify_response, headers_from_pairs, Fetcher, NetError, Request, ResponseClass};
use finsync_store::{LocalDatabase, QueuedOperation, StoreError, StoreResult};
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{WorkerError, WorkerResult};

// ==================== Registration ====================

/// Background sync registration, as seen by the worker.
#[async_trait]
pub trait SyncRegistrar: Send + Sync + 'static {
    /// Ask to be woken with `tag` once connectivity allows.
    async fn register(&self, tag: &str) -> WorkerResult<()>;

    /// Called after a sync pass for `tag` ran.
    async fn sync_finished(&self, _tag: &str, _report: &SyncReport) {}
}

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Online,
    Offline,
}

/// A registered sync tag.
#[derive(Debug, Clone)]
struct SyncTask {
    /// Passes started for this registration.
    attempts: u32,
    /// Waiting to be handed out by `take_ready_tags`.
    ready: bool,
}

#[derive(Debug)]
struct SyncManagerState {
    tasks: BTreeMap<String, SyncTask>,
    network_state: NetworkState,
}

/// In-process background sync registry.
///
/// A tag registered while online is ready immediately; one registered while
/// offline becomes ready on the next offline → online transition. A pass
/// that leaves work behind keeps the tag registered until the next
/// transition.
#[derive(Debug)]
pub struct SyncManager {
    state: Mutex<SyncManagerState>,
}

impl SyncManager {
    /// Create a manager with the given initial connectivity.
    pub fn new(network_state: NetworkState) -> Self {
        Self {
            state: Mutex::new(SyncManagerState {
                tasks: BTreeMap::new(),
                network_state,
            }),
        }
    }

    /// Record a connectivity change.
    pub async fn update_network_state(&self, network_state: NetworkState) {
        let mut state = self.state.lock().await;
        if state.network_state == NetworkState::Offline && network_state == NetworkState::Online {
            for task in state.tasks.values_mut() {
                task.ready = true;
            }
            info!(pending = state.tasks.len(), "Back online");
        }
        state.network_state = network_state;
    }

    /// Current connectivity.
    pub async fn network_state(&self) -> NetworkState {
        self.state.lock().await.network_state
    }

    /// Tags that should be dispatched now. Each ready tag is handed out once.
    pub async fn take_ready_tags(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        if state.network_state != NetworkState::Online {
            return Vec::new();
        }

        let mut ready = Vec::new();
        for (tag, task) in state.tasks.iter_mut() {
            if task.ready {
                task.ready = false;
                task.attempts += 1;
                ready.push(tag.clone());
            }
        }
        ready
    }

    /// Registered tags.
    pub async fn tags(&self) -> Vec<String> {
        self.state.lock().await.tasks.keys().cloned().collect()
    }

    /// Passes started for a tag's current registration.
    pub async fn attempts(&self, tag: &str) -> Option<u32> {
        self.state.lock().await.tasks.get(tag).map(|t| t.attempts)
    }

    /// Drop a registration.
    pub async fn unregister(&self, tag: &str) -> bool {
        self.state.lock().await.tasks.remove(tag).is_some()
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(NetworkState::Online)
    }
}

#[async_trait]
impl SyncRegistrar for SyncManager {
    async fn register(&self, tag: &str) -> WorkerResult<()> {
        if tag.is_empty() {
            return Err(WorkerError::Registration("empty sync tag".to_string()));
        }

        let mut state = self.state.lock().await;
        let online = state.network_state == NetworkState::Online;
        let task = state.tasks.entry(tag.to_string()).or_insert(SyncTask {
            attempts: 0,
            ready: false,
        });
        task.attempts = 0;
        task.ready = online;

        debug!(tag, online, "Sync registered");
        Ok(())
    }

    async fn sync_finished(&self, tag: &str, report: &SyncReport) {
        if report.is_complete() {
            self.state.lock().await.tasks.remove(tag);
        }
    }
}

// ==================== Processor ====================

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl SyncReport {
    /// Nothing was left behind.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Persists failed mutations and replays them.
pub struct SyncQueueProcessor {
    fetcher: Arc<dyn Fetcher>,
    database: LocalDatabase,
    registrar: Arc<dyn SyncRegistrar>,
    tag: String,
}

impl SyncQueueProcessor {
    /// Create a processor that registers and answers to `tag`.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        database: LocalDatabase,
        registrar: Arc<dyn SyncRegistrar>,
        tag: &str,
    ) -> Self {
        Self {
            fetcher,
            database,
            registrar,
            tag: tag.to_string(),
        }
    }

    /// The sync tag this processor drains on.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Persist a request for later replay and register the sync tag.
    ///
    /// A body that is not UTF-8 cannot be stored as text and is refused with
    /// `StoreError::DataError`; nothing is queued. Registration failure is
    /// logged; the operation stays queued either way.
    pub async fn enqueue(&self, request: &Request) -> StoreResult<i64> {
        let body = request
            .body_text()
            .map_err(|e| StoreError::DataError(format!("{} {}: {}", request.method, request.url, e)))?;

        let operation = QueuedOperation::new(
            request.method.as_str(),
            request.url.as_str(),
            request.header_pairs(),
            body,
        );

        let store = self.database.open().await?;
        let id = store.enqueue(&operation).await?;
        info!(id, method = %operation.method, url = %operation.url, "Request queued for sync");

        if let Err(e) = self.registrar.register(&self.tag).await {
            warn!(tag = %self.tag, error = %e, "Background sync registration failed");
        }

        Ok(id)
    }

    /// Handle a sync trigger. Returns `None` for tags this processor does not own.
    pub async fn handle_sync(&self, tag: &str) -> WorkerResult<Option<SyncReport>> {
        if tag != self.tag {
            debug!(tag, "Ignoring sync for unknown tag");
            return Ok(None);
        }

        let report = self.replay_all().await?;
        self.registrar.sync_finished(tag, &report).await;
        Ok(Some(report))
    }

    /// Replay every queued operation once, oldest first. Successes are
    /// removed; failures stay queued and do not stop the pass.
    pub async fn replay_all(&self) -> WorkerResult<SyncReport> {
        let store = self.database.open().await?;
        let operations = store.queued_operations().await?;
        let mut report = SyncReport::default();

        for operation in operations {
            report.attempted += 1;

            let Some(id) = operation.id else {
                warn!(url = %operation.url, "Queued operation without id");
                report.failed += 1;
                continue;
            };

            let request = match replay_request(&operation) {
                Ok(request) => request,
                Err(e) => {
                    warn!(id, error = %e, "Queued operation cannot be rebuilt");
                    report.failed += 1;
                    continue;
                }
            };

            match self.fetcher.fetch(&request).await {
                Ok(response) if classify_response(response.status) == ResponseClass::Success => {
                    match store.dequeue(id).await {
                        Ok(_) => {
                            debug!(id, status = response.status, "Queued operation replayed");
                            report.succeeded += 1;
                        }
                        Err(e) => {
                            // Sent but still queued; it will be sent again.
                            warn!(id, error = %e, "Replayed operation could not be removed");
                            report.failed += 1;
                        }
                    }
                }
                Ok(response) => {
                    warn!(id, status = response.status, url = %operation.url, "Replay rejected");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(id, error = %e, url = %operation.url, "Replay failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Sync pass finished"
        );
        Ok(report)
    }
}

/// Rebuild the original request from a queued operation.
pub fn replay_request(operation: &QueuedOperation) -> WorkerResult<Request> {
    let url = Url::parse(&operation.url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
    let method = Method::from_bytes(operation.method.as_bytes())
        .map_err(|e| WorkerError::Client(format!("bad method {:?}: {}", operation.method, e)))?;

    let mut request = Request::new(method, url);
    request.headers = headers_from_pairs(&operation.headers);
    request.body = operation.body.clone().map(Bytes::from);
    Ok(request)
}
