//! The worker and its event dispatch table.

use std::sync::Arc;

use bytes::Bytes;
use finsync_cache::CacheStorage;
use finsync_common::WorkerConfig;
use finsync_net::{Fetcher, Request, Response};
use finsync_store::LocalDatabase;
use tracing::{debug, info, info_span, Instrument};

use crate::lifecycle::{Activation, Client, Clients, Lifecycle, WorkerState};
use crate::push::{click_response, ClickResponse, Notification, PushPayload};
use crate::router::{Route, Router};
use crate::strategy::Strategies;
use crate::sync::{SyncManager, SyncQueueProcessor, SyncRegistrar, SyncReport};
use crate::WorkerResult;

/// An event delivered to the worker by its host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Sync { tag: String },
    Push(Option<Bytes>),
    NotificationClick { action: Option<String> },
}

impl WorkerEvent {
    /// Event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Sync { .. } => "sync",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick { .. } => "notificationclick",
        }
    }
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed,
    Activated(Activation),
    /// The answer to an intercepted request.
    Response(Response),
    /// The worker does not handle this request.
    Passthrough,
    Synced(SyncReport),
    /// Sync for a tag the worker does not own.
    SyncIgnored,
    /// Show this notification.
    ShowNotification(Notification),
    /// Notification closed and a window opened.
    WindowOpened(Client),
    /// Notification closed.
    NotificationClosed,
}

/// The offline-sync worker.
///
/// All dependencies are injected; the same worker may handle overlapping
/// events.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    router: Router,
    strategies: Strategies,
    sync: Arc<SyncQueueProcessor>,
    lifecycle: Lifecycle,
    clients: Arc<Clients>,
    caches: CacheStorage,
    database: LocalDatabase,
}

impl OfflineWorker {
    /// Assemble a worker.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        database: LocalDatabase,
        registrar: Arc<dyn SyncRegistrar>,
    ) -> Self {
        let config = Arc::new(config);
        let clients = Arc::new(Clients::new());
        let sync = Arc::new(SyncQueueProcessor::new(
            Arc::clone(&fetcher),
            database.clone(),
            registrar,
            &config.sync_tag,
        ));
        let strategies = Strategies::new(
            Arc::clone(&config),
            Arc::clone(&fetcher),
            caches.clone(),
            database.clone(),
            Arc::clone(&sync),
        );
        let lifecycle = Lifecycle::new(
            Arc::clone(&config),
            fetcher,
            caches.clone(),
            database.clone(),
            Arc::clone(&clients),
        );

        Self {
            router: Router::new(&config),
            config,
            strategies,
            sync,
            lifecycle,
            clients,
            caches,
            database,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        self.lifecycle.state().await
    }

    /// Whether the last install asked to skip waiting.
    pub async fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.skip_waiting_requested().await
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn database(&self) -> &LocalDatabase {
        &self.database
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn sync_processor(&self) -> &SyncQueueProcessor {
        &self.sync
    }

    /// Handle one event.
    pub async fn dispatch(&self, event: WorkerEvent) -> WorkerResult<EventOutcome> {
        let span = info_span!("worker_event", kind = event.kind());
        async move {
            match event {
                WorkerEvent::Install => {
                    self.lifecycle.install().await?;
                    Ok(EventOutcome::Installed)
                }
                WorkerEvent::Activate => Ok(EventOutcome::Activated(self.lifecycle.activate().await?)),
                WorkerEvent::Fetch(request) => Ok(match self.handle_fetch(&request).await {
                    Some(response) => EventOutcome::Response(response),
                    None => EventOutcome::Passthrough,
                }),
                WorkerEvent::Sync { tag } => Ok(match self.sync.handle_sync(&tag).await? {
                    Some(report) => EventOutcome::Synced(report),
                    None => EventOutcome::SyncIgnored,
                }),
                WorkerEvent::Push(data) => {
                    let payload = PushPayload::parse(data.as_deref());
                    let notification = Notification::from_payload(payload, &self.config.notifications);
                    debug!(title = %notification.title, "Push received");
                    Ok(EventOutcome::ShowNotification(notification))
                }
                WorkerEvent::NotificationClick { action } => self.notification_click(action.as_deref()).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Answer an intercepted request. `None` means the host should perform
    /// it unmodified.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
        let route = self.router.route(request);
        debug!(method = %request.method, url = %request.url, ?route, "Fetch");
        if route == Route::Passthrough {
            return None;
        }
        self.strategies.handle(route, request).await
    }

    async fn notification_click(&self, action: Option<&str>) -> WorkerResult<EventOutcome> {
        match click_response(action) {
            ClickResponse::OpenApp => {
                let url = self.config.resolve(&self.config.notifications.open_url)?;
                let client = self.clients.open_window(url).await;
                Ok(EventOutcome::WindowOpened(client))
            }
            ClickResponse::Close => Ok(EventOutcome::NotificationClosed),
        }
    }

    /// Dispatch a sync event for every tag the manager reports ready.
    pub async fn fire_ready_syncs(&self, manager: &SyncManager) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        for tag in manager.take_ready_tags().await {
            match self.dispatch(WorkerEvent::Sync { tag: tag.clone() }).await {
                Ok(EventOutcome::Synced(report)) => reports.push(report),
                Ok(_) => {}
                Err(e) => info!(tag = %tag, error = %e, retryable = e.is_retryable(), "Sync pass failed"),
            }
        }
        reports
    }
}
