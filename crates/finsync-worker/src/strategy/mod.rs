//! Per-route caching strategies.
//!
//! Every strategy resolves to a `Response`; failures along the way are
//! logged and turned into the next fallback.

use std::sync::Arc;

use finsync_cache::{Bucket, CacheStorage};
use finsync_common::WorkerConfig;
use finsync_net::{Fetcher, Request, Response, ResponseSource};
use finsync_store::LocalDatabase;
use http::{HeaderName, HeaderValue, Method};
use tracing::warn;

use crate::router::Route;
use crate::sync::SyncQueueProcessor;

mod api;
mod document;
mod revalidate;
mod shell;

/// Header naming where an offline answer came from (`cache` or `local-store`).
pub const SOURCE_HEADER: &str = "x-finsync-source";

/// The strategy handlers and the dependencies they share.
#[derive(Clone)]
pub struct Strategies {
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    database: LocalDatabase,
    sync: Arc<SyncQueueProcessor>,
}

impl Strategies {
    /// Create the handlers.
    pub fn new(
        config: Arc<WorkerConfig>,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        database: LocalDatabase,
        sync: Arc<SyncQueueProcessor>,
    ) -> Self {
        Self {
            config,
            fetcher,
            caches,
            database,
            sync,
        }
    }

    /// Run the strategy for a route. `None` for passthrough.
    pub async fn handle(&self, route: Route, request: &Request) -> Option<Response> {
        let response = match route {
            Route::Passthrough => return None,
            Route::Api => self.api(request).await,
            Route::Static => self.shell(request).await,
            Route::Document => self.document(request).await,
            Route::Other => self.revalidate(request).await,
        };
        Some(response)
    }

    async fn bucket(&self, name: &str) -> Bucket {
        self.caches.open(name).await
    }

    /// Store a response, logging instead of failing.
    async fn remember(&self, bucket: &Bucket, request: &Request, response: &Response) {
        if request.method != Method::GET {
            return;
        }
        if let Err(e) = bucket.put(request, response).await {
            warn!(cache = bucket.name(), url = %request.url, error = %e, "Cache write failed");
        }
    }

    /// Label a response served without the network.
    fn offline_copy(&self, response: Response, source: ResponseSource) -> Response {
        let response = response.with_source(source);
        if !self.config.mark_offline_responses {
            return response;
        }

        let label = match source {
            ResponseSource::LocalStore => "local-store",
            _ => "cache",
        };
        response.with_header(HeaderName::from_static(SOURCE_HEADER), HeaderValue::from_static(label))
    }
}
