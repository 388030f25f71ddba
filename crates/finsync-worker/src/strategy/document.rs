//! Network-first for page navigations.

use finsync_net::{Request, Response};
use tracing::debug;

use super::Strategies;

impl Strategies {
    /// Handle a navigation.
    ///
    /// Fallbacks, in order: the cached copy of this document, the cached app
    /// root from any cache, the error response the server gave, a network
    /// error.
    pub async fn document(&self, request: &Request) -> Response {
        let bucket = self.bucket(&self.config.caches.dynamic_bucket).await;

        let failed = match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => {
                self.remember(&bucket, request, &response).await;
                return response;
            }
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "Document error status");
                Some(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Document unreachable");
                None
            }
        };

        if let Some(hit) = bucket.match_request(request).await {
            return hit;
        }

        if let Ok(root) = request.url.join("/") {
            if let Some(hit) = self.caches.match_any(&Request::get(root)).await {
                debug!(url = %request.url, "Serving app root for document");
                return hit;
            }
        }

        failed.unwrap_or_else(Response::network_error)
    }
}
