//! # FinSync Worker
//!
//! The offline-sync worker of the finance app: intercepts every request the
//! page makes, applies a caching strategy per route, keeps the last good API
//! payloads in the local store and queues mutations for replay.
//!
//! ## Features
//!
//! - **Routing**: API, shell asset, document and "other" routes
//! - **Strategies**: network-first with cache/store/queue fallback for the
//!   API, cache-first for the shell, network-first for documents,
//!   stale-while-revalidate for everything else
//! - **Sync**: durable offline queue replayed on the `sync-transactions` tag
//! - **Lifecycle**: install (pre-cache shell), activate (evict stale caches,
//!   claim clients)
//! - **Push**: notification shape and click handling
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker::dispatch(WorkerEvent)
//!     ├── Install / Activate ──► Lifecycle ──► CacheStorage, LocalDatabase, Clients
//!     ├── Fetch ──► Router ──► Strategies ──► Fetcher, CacheStorage, LocalDatabase
//!     │                                  └──► SyncQueueProcessor::enqueue
//!     ├── Sync ──► SyncQueueProcessor::replay_all
//!     └── Push / NotificationClick ──► push
//! ```

use finsync_cache::CacheError;
use finsync_common::FinSyncError;
use finsync_net::NetError;
use finsync_store::StoreError;
use thiserror::Error;

pub mod lifecycle;
pub mod push;
pub mod router;
pub mod strategy;
pub mod sync;
pub mod worker;

pub use lifecycle::{Activation, Client, Clients, Lifecycle, WorkerState};
pub use push::{Notification, NotificationAction, PushPayload};
pub use router::{Route, Router};
pub use strategy::{Strategies, SOURCE_HEADER};
pub use sync::{NetworkState, SyncManager, SyncQueueProcessor, SyncRegistrar, SyncReport};
pub use worker::{EventOutcome, OfflineWorker, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed: {0}")]
    Install(String),

    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        state: WorkerState,
        action: &'static str,
    },

    #[error("Sync registration failed: {0}")]
    Registration(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Common(#[from] FinSyncError),
}

impl WorkerError {
    /// Check if the operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Install(_) | WorkerError::Network(_) => true,
            WorkerError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
