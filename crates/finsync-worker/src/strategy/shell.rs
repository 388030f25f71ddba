//! Cache-first for the app shell.

use finsync_net::{Request, Response};
use tracing::{debug, trace};

use super::Strategies;

impl Strategies {
    /// Handle a shell asset request.
    pub async fn shell(&self, request: &Request) -> Response {
        let bucket = self.bucket(&self.config.caches.static_bucket).await;
        if let Some(hit) = bucket.match_request(request).await {
            trace!(url = %request.url, "Shell asset from cache");
            return hit;
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.remember(&bucket, request, &response).await;
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Shell asset unavailable");
                Response::text(503, &self.config.messages.static_unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use finsync_net::{Response, ResponseSource};

    #[tokio::test]
    async fn test_hit_skips_network() {
        let h = harness();
        let bucket = h.caches.open(&h.config.caches.static_bucket).await;
        bucket
            .put(&get("/manifest.json"), &Response::new(200, "{}"))
            .await
            .unwrap();

        let response = h.strategies.shell(&get("/manifest.json")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(h.fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_miss_fetches_once_and_stores() {
        let h = harness();
        h.fetcher.respond("/logo192.png", Some(Response::new(200, "png")));

        let response = h.strategies.shell(&get("/logo192.png")).await;
        assert_eq!(response.status, 200);
        assert_eq!(h.fetcher.call_count(), 1);

        let bucket = h.caches.open(&h.config.caches.static_bucket).await;
        assert!(bucket.match_request(&get("/logo192.png")).await.is_some());

        // Second request is served from the cache.
        h.strategies.shell(&get("/logo192.png")).await;
        assert_eq!(h.fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_error_status_returned_uncached() {
        let h = harness();
        h.fetcher.respond("/favicon.ico", Some(Response::new(404, "")));

        let response = h.strategies.shell(&get("/favicon.ico")).await;
        assert_eq!(response.status, 404);
        let bucket = h.caches.open(&h.config.caches.static_bucket).await;
        assert!(bucket.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_miss_is_503_text() {
        let h = harness();
        let response = h.strategies.shell(&get("/index.html")).await;
        assert_eq!(response.status, 503);
        assert_eq!(response.header_str("content-type"), Some("text/plain"));
        assert_eq!(response.text_body().unwrap(), h.config.messages.static_unavailable);
    }
}
