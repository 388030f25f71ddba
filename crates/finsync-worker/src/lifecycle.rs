//! Install/activate state machine and controlled clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use finsync_cache::CacheStorage;
use finsync_common::WorkerConfig;
use finsync_net::{Fetcher, Request};
use finsync_store::LocalDatabase;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{WorkerError, WorkerResult};

// ==================== State ====================

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    Installing,
    /// Shell cached and store initialized.
    Installed,
    Activating,
    /// Stale caches evicted, clients claimed.
    Active,
    /// Install failed.
    Redundant,
}

impl WorkerState {
    /// Whether `install` may start from this state.
    pub fn can_install(self) -> bool {
        matches!(self, WorkerState::Parsed | WorkerState::Redundant)
    }

    /// Whether `activate` may start from this state.
    pub fn can_activate(self) -> bool {
        self == WorkerState::Installed
    }
}

// ==================== Clients ====================

/// A window controlled (or controllable) by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub focused: bool,
    /// Whether this worker controls the page.
    pub controlled: bool,
}

/// Window clients of the worker's origin.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an existing page.
    pub async fn add(&self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            focused: false,
            controlled: false,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// All clients, optionally including ones not yet controlled.
    pub async fn match_all(&self, include_uncontrolled: bool) -> Vec<Client> {
        let mut clients: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| include_uncontrolled || c.controlled)
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Open a focused, controlled window.
    pub async fn open_window(&self, url: Url) -> Client {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            client.focused = false;
        }

        let client = Client {
            id: next_client_id(),
            url,
            focused: true,
            controlled: true,
        };
        clients.insert(client.id.clone(), client.clone());
        debug!(id = %client.id, url = %client.url, "Window opened");
        client
    }

    /// Take control of every client. Returns how many were newly claimed.
    pub async fn claim(&self) -> usize {
        let mut claimed = 0;
        for client in self.clients.write().await.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        claimed
    }

    /// Stop tracking a closed page.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

// ==================== Lifecycle ====================

/// What activation did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Activation {
    /// Stale cache names removed.
    pub deleted_caches: Vec<String>,
    /// Clients newly claimed.
    pub claimed: usize,
}

/// Drives install and activate.
pub struct Lifecycle {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    database: LocalDatabase,
    clients: Arc<Clients>,
    state: Mutex<WorkerState>,
    skip_waiting: Mutex<bool>,
}

impl Lifecycle {
    /// Create a controller in the `Parsed` state.
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        database: LocalDatabase,
        clients: Arc<Clients>,
    ) -> Self {
        Self {
            config,
            fetcher,
            caches,
            database,
            clients,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: Mutex::new(false),
        }
    }

    /// Current state.
    pub async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    /// Whether install asked to activate without waiting for old clients.
    pub async fn skip_waiting_requested(&self) -> bool {
        *self.skip_waiting.lock().await
    }

    async fn transition(
        &self,
        action: &'static str,
        allowed: fn(WorkerState) -> bool,
        next: WorkerState,
    ) -> WorkerResult<()> {
        let mut state = self.state.lock().await;
        if !allowed(*state) {
            return Err(WorkerError::InvalidState {
                state: *state,
                action,
            });
        }
        debug!(from = ?*state, to = ?next, "Worker state change");
        *state = next;
        Ok(())
    }

    async fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().await;
        debug!(from = ?*state, to = ?next, "Worker state change");
        *state = next;
    }

    /// Pre-cache the app shell and initialize the local store.
    ///
    /// Every shell asset must load with a 2xx status. Nothing is cached
    /// unless all of them do; on failure the worker becomes `Redundant`
    /// and install may be retried.
    pub async fn install(&self) -> WorkerResult<()> {
        self.transition("install", WorkerState::can_install, WorkerState::Installing)
            .await?;

        match self.populate().await {
            Ok(cached) => {
                self.set_state(WorkerState::Installed).await;
                *self.skip_waiting.lock().await = true;
                info!(assets = cached, "Worker installed");
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant).await;
                warn!(error = %e, "Worker install failed");
                Err(e)
            }
        }
    }

    async fn populate(&self) -> WorkerResult<usize> {
        let mut fetched = Vec::with_capacity(self.config.static_assets.len());

        for asset in &self.config.static_assets {
            let request = Request::get(self.config.resolve(asset)?);
            let response = self
                .fetcher
                .fetch(&request)
                .await
                .map_err(|e| WorkerError::Install(format!("{}: {}", asset, e)))?;

            if !response.ok() {
                return Err(WorkerError::Install(format!(
                    "{} returned status {}",
                    asset, response.status
                )));
            }
            fetched.push((request, response));
        }

        let bucket = self.caches.open(&self.config.caches.static_bucket).await;
        for (request, response) in &fetched {
            bucket.put(request, response).await?;
        }

        self.database.open().await?;
        Ok(fetched.len())
    }

    /// Evict every cache outside the current three names and claim clients.
    pub async fn activate(&self) -> WorkerResult<Activation> {
        self.transition("activate", WorkerState::can_activate, WorkerState::Activating)
            .await?;

        let deleted_caches = self
            .caches
            .retain_only(&self.config.caches.allow_list())
            .await;
        let claimed = self.clients.claim().await;

        self.set_state(WorkerState::Active).await;
        info!(deleted = deleted_caches.len(), claimed, "Worker activated");

        Ok(Activation {
            deleted_caches,
            claimed,
        })
    }
}
