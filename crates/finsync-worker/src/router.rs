//! Request classification.

use finsync_common::WorkerConfig;
use finsync_net::{Destination, Request};
use hashbrown::HashSet;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Not handled; the host performs the request itself.
    Passthrough,
    /// Network-first with cache, local store and queue fallback.
    Api,
    /// Cache-first app shell asset.
    Static,
    /// Network-first top-level document.
    Document,
    /// Stale-while-revalidate.
    Other,
}

/// Classifies requests. Rules are checked in order; the first match wins.
#[derive(Debug, Clone)]
pub struct Router {
    api_prefix: String,
    static_assets: HashSet<String>,
}

impl Router {
    /// Router for a configuration.
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            api_prefix: config.api_prefix.clone(),
            static_assets: config.static_assets.iter().cloned().collect(),
        }
    }

    /// Pick the route for a request.
    pub fn route(&self, request: &Request) -> Route {
        if !request.is_http() {
            return Route::Passthrough;
        }

        let path = request.path();
        if path.starts_with(&self.api_prefix) {
            Route::Api
        } else if self.static_assets.contains(path) {
            Route::Static
        } else if request.destination == Destination::Document {
            Route::Document
        } else {
            Route::Other
        }
    }
}
